//! Text command protocol.
//!
//! Clients send one newline-terminated command per line and receive one line
//! holding a numeric reply code for every action verb:
//!
//! | Command | Request | Reply |
//! |---|---|---|
//! | `dump` | FLUSH + CAPTURE | outcome code |
//! | `flush` | FLUSH | outcome code |
//! | `accum <frames>` | FLUSH + ACCUMULATE | outcome code |
//! | `track <frames>` | FLUSH + TRACK_HIGHLIGHTS | outcome code |
//! | `thresh <level> [<frames>]` | FLUSH + THRESHOLD | max count above `level` |
//! | `set <param> <value>` | SET_PARAMETER | outcome code |
//! | `close` | | none, connection closed |
//! | `shutdown` | | none, worker and server stop |
//!
//! Outcome codes: 1 completed, 0 timed out, -1 failed, -2 malformed command,
//! -3 worker stopped. Unknown verbs get no reply.

use crate::capture::DeviceParameter;
use crate::error::{CaptureError, CaptureResult};
use crate::worker::{ActionRequest, REPLY_ABORTED, REPLY_MALFORMED};
use thiserror::Error;

/// Frames sampled by `thresh` when no count is given.
pub const DEFAULT_THRESHOLD_FRAMES: u32 = 1;

/// A parsed client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `dump`: store one raw frame.
    Dump,
    /// `flush`: discard stale frames.
    Flush,
    /// `accum <frames>`
    Accumulate {
        /// Frames to sum.
        frames: u32,
    },
    /// `track <frames>`
    Track {
        /// Frames to track.
        frames: u32,
    },
    /// `thresh <level> [<frames>]`
    Threshold {
        /// Samples strictly above this level are counted.
        level: u8,
        /// Frames to sample.
        frames: u32,
    },
    /// `set <param> <value>`
    Set {
        /// Numeric parameter id, see [`DeviceParameter`].
        parameter: u32,
        /// Value passed to the device.
        value: i32,
    },
    /// `close`: end this client connection.
    Close,
    /// `shutdown`: stop the worker and the server.
    Shutdown,
}

/// Why a line did not parse into a [`Command`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Known verb with missing or invalid arguments.
    #[error("Malformed arguments for '{verb}'")]
    Malformed {
        /// The verb as sent.
        verb: &'static str,
    },

    /// Verb not recognised; no reply is sent.
    #[error("Unknown command '{0}'")]
    Unknown(String),

    /// Blank line.
    #[error("Empty command")]
    Empty,
}

impl ProtocolError {
    /// Reply owed to the client, if any.
    #[must_use]
    pub fn reply_code(&self) -> Option<i64> {
        match self {
            ProtocolError::Malformed { .. } => Some(REPLY_MALFORMED),
            ProtocolError::Unknown(_) | ProtocolError::Empty => None,
        }
    }
}

/// Parse one command line. Surrounding whitespace and control characters are ignored.
pub fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(ProtocolError::Empty);
    };
    let args: Vec<&str> = words.collect();

    match verb {
        "dump" => Ok(Command::Dump),
        "flush" => Ok(Command::Flush),
        "accum" => Ok(Command::Accumulate {
            frames: single_arg(&args, "accum")?,
        }),
        "track" => Ok(Command::Track {
            frames: single_arg(&args, "track")?,
        }),
        "thresh" => {
            let malformed = ProtocolError::Malformed { verb: "thresh" };
            let (level, frames) = match args.as_slice() {
                [level] => (*level, None),
                [level, frames] => (*level, Some(*frames)),
                _ => return Err(malformed),
            };
            let level = level.parse::<u8>().map_err(|_| malformed.clone())?;
            let frames = match frames {
                Some(frames) => frames.parse::<u32>().map_err(|_| malformed.clone())?,
                None => DEFAULT_THRESHOLD_FRAMES,
            };
            if frames == 0 {
                return Err(malformed);
            }
            Ok(Command::Threshold { level, frames })
        }
        "set" => match args.as_slice() {
            [parameter, value] => {
                let malformed = || ProtocolError::Malformed { verb: "set" };
                Ok(Command::Set {
                    parameter: parameter.parse().map_err(|_| malformed())?,
                    value: value.parse().map_err(|_| malformed())?,
                })
            }
            _ => Err(ProtocolError::Malformed { verb: "set" }),
        },
        "close" => Ok(Command::Close),
        "shutdown" => Ok(Command::Shutdown),
        other => Err(ProtocolError::Unknown(other.to_string())),
    }
}

fn single_arg(args: &[&str], verb: &'static str) -> Result<u32, ProtocolError> {
    match args {
        [value] => value
            .parse::<u32>()
            .map_err(|_| ProtocolError::Malformed { verb }),
        _ => Err(ProtocolError::Malformed { verb }),
    }
}

impl Command {
    /// Worker request for this command. `close` and `shutdown` have none.
    pub fn to_request(&self) -> CaptureResult<Option<ActionRequest>> {
        let request = match *self {
            Command::Dump => ActionRequest::capture().with_flush(),
            Command::Flush => ActionRequest::flush(),
            Command::Accumulate { frames } => ActionRequest::accumulate(frames).with_flush(),
            Command::Track { frames } => ActionRequest::track(frames).with_flush(),
            Command::Threshold { level, frames } => {
                ActionRequest::threshold(level, frames).with_flush()
            }
            Command::Set { parameter, value } => {
                ActionRequest::set_parameter(DeviceParameter::try_from(parameter)?, value)
            }
            Command::Close | Command::Shutdown => return Ok(None),
        };
        Ok(Some(request))
    }
}

/// Reply code for a request the worker could not run.
#[must_use]
pub fn reply_for_error(err: &CaptureError) -> i64 {
    match err {
        CaptureError::WorkerStopped => REPLY_ABORTED,
        _ => -1,
    }
}

/// One reply line.
#[must_use]
pub fn format_reply(code: i64) -> String {
    format!("{code}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ActionFlags;

    #[test]
    fn test_parse_action_verbs() {
        assert_eq!(parse_command("dump\n"), Ok(Command::Dump));
        assert_eq!(parse_command("flush"), Ok(Command::Flush));
        assert_eq!(parse_command("accum 10\r\n"), Ok(Command::Accumulate { frames: 10 }));
        assert_eq!(parse_command("track 3"), Ok(Command::Track { frames: 3 }));
        assert_eq!(
            parse_command("set 1 65"),
            Ok(Command::Set {
                parameter: 1,
                value: 65
            })
        );
    }

    #[test]
    fn test_thresh_frames_default_to_one() {
        assert_eq!(
            parse_command("thresh 100"),
            Ok(Command::Threshold {
                level: 100,
                frames: 1
            })
        );
        assert_eq!(
            parse_command("thresh 120 5"),
            Ok(Command::Threshold {
                level: 120,
                frames: 5
            })
        );
    }

    #[test]
    fn test_malformed_arguments() {
        for line in ["accum", "accum x", "track -1", "thresh", "thresh 300", "thresh 10 0", "set 1"] {
            let err = parse_command(line).unwrap_err();
            assert_eq!(err.reply_code(), Some(REPLY_MALFORMED), "{line}");
        }
    }

    #[test]
    fn test_unknown_and_empty_get_no_reply() {
        assert_eq!(parse_command("bogus 1").unwrap_err().reply_code(), None);
        assert_eq!(parse_command("   \n"), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_requests_carry_flush_prefix() {
        let request = Command::Accumulate { frames: 4 }.to_request().unwrap().unwrap();
        assert_eq!(request.actions, ActionFlags::FLUSH | ActionFlags::ACCUMULATE);
        assert_eq!(request.frames, 4);

        let request = Command::Dump.to_request().unwrap().unwrap();
        assert_eq!(request.actions, ActionFlags::FLUSH | ActionFlags::CAPTURE);

        assert_eq!(Command::Close.to_request().unwrap(), None);
    }

    #[test]
    fn test_unsupported_parameter() {
        let err = Command::Set {
            parameter: 42,
            value: 1,
        }
        .to_request()
        .unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedParameter(42)));
        assert_eq!(reply_for_error(&err), -1);
        assert_eq!(reply_for_error(&CaptureError::WorkerStopped), REPLY_ABORTED);
    }

    #[test]
    fn test_format_reply() {
        assert_eq!(format_reply(-2), "-2\n");
    }
}
