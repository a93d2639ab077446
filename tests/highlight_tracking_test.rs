//! End-to-end highlight tracking: simulated sensor -> frame pump -> tracker -> text records.

use highlight_daq::capture::{
    FrameFormat, FramePump, PixelFormat, SimulatedCamera, SlotState, Spot, SyntheticScene,
};
use highlight_daq::highlights::{
    HighlightSink, HighlightTrack, HighlightTracker, TextHighlightWriter, TrackerConfig,
};
use std::time::Duration;

const WIDTH: u32 = 16;
const HEIGHT: u32 = 8;

fn two_spot_scene() -> SyntheticScene {
    SyntheticScene::spots(
        WIDTH,
        HEIGHT,
        20,
        &[
            Spot {
                x: 3,
                y: 2,
                width: 4,
                height: 3,
                level: 250,
            },
            Spot {
                x: 10,
                y: 5,
                width: 2,
                height: 2,
                level: 230,
            },
        ],
    )
}

fn track_one(pump: &mut FramePump<SimulatedCamera>, tracker: &mut HighlightTracker) -> Vec<HighlightTrack> {
    let guard = pump
        .acquire_frame(Duration::from_millis(100))
        .unwrap()
        .expect("frame");
    let tracks = tracker.track_frame(&guard.frame()).to_vec();
    guard.release().unwrap();
    tracks
}

#[test]
fn test_spots_tracked_from_yuyv_frames() {
    let format = FrameFormat::packed(WIDTH, HEIGHT, PixelFormat::Yuyv);
    let camera = SimulatedCamera::new("sim0", format, two_spot_scene());
    let mut pump = FramePump::open(camera, 4).unwrap();
    pump.start().unwrap();
    let mut tracker = HighlightTracker::default();

    let tracks = track_one(&mut pump, &mut tracker);
    assert_eq!(tracks.len(), 2);

    // The upper spot ends first and is emitted first.
    let upper = tracks[0];
    assert_eq!(upper.total_points, 12);
    assert_eq!(upper.x_moment, 120);
    assert_eq!(upper.y_sum, 36);
    assert_eq!(upper.centroid(), Some((5.0, 3.0)));

    let lower = tracks[1];
    assert_eq!(lower.total_points, 4);
    assert_eq!(lower.centroid(), Some((11.0, 5.5)));
}

#[test]
fn test_results_are_stable_across_frames() {
    let format = FrameFormat::packed(WIDTH, HEIGHT, PixelFormat::Yuyv);
    let camera = SimulatedCamera::new("sim0", format, two_spot_scene());
    let mut pump = FramePump::open(camera, 2).unwrap();
    pump.start().unwrap();
    let mut tracker = HighlightTracker::default();

    let first = track_one(&mut pump, &mut tracker);
    for _ in 0..5 {
        assert_eq!(track_one(&mut pump, &mut tracker), first);
    }
    assert_eq!(pump.pool().count_in(SlotState::OwnedByConsumer), 0);
    assert_eq!(pump.pool().count_in(SlotState::QueuedToHardware), 2);
}

#[test]
fn test_arena_limit_keeps_earliest_tracks() {
    let spots: Vec<Spot> = (0..4)
        .map(|i| Spot {
            x: i * 4,
            y: 1,
            width: 2,
            height: 2,
            level: 255,
        })
        .collect();
    let scene = SyntheticScene::spots(WIDTH, HEIGHT, 0, &spots);
    let format = FrameFormat::packed(WIDTH, HEIGHT, PixelFormat::Grey);
    let mut pump = FramePump::open(SimulatedCamera::new("sim0", format, scene), 2).unwrap();
    pump.start().unwrap();

    let mut tracker = HighlightTracker::new(TrackerConfig {
        max_tracks: 3,
        ..TrackerConfig::default()
    });
    let tracks = track_one(&mut pump, &mut tracker);

    let columns: Vec<u32> = tracks.iter().map(|t| t.lx).collect();
    assert_eq!(columns, vec![0, 4, 8]);
    assert_eq!(tracker.dropped_intervals(), 2);
}

#[test]
fn test_text_records_group_devices_per_line() {
    let mut writer = TextHighlightWriter::new(Vec::new(), 2);
    let upper = HighlightTrack {
        lx: 3,
        rx: 7,
        last_row: 4,
        total_points: 12,
        x_moment: 120,
        y_sum: 36,
    };

    for _ in 0..2 {
        writer.session_start(0).unwrap();
        writer.highlight(0, &upper).unwrap();
        writer.session_end(0).unwrap();
        writer.session_start(1).unwrap();
        writer.session_end(1).unwrap();
    }

    let text = String::from_utf8(writer.into_inner()).unwrap();
    assert_eq!(text, "[(0,12,120,36);];\n[(0,12,120,36);];\n");
}
