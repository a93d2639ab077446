//! TCP command server.
//!
//! Serves one client at a time on `port_base + device index`. Each command
//! line is parsed, turned into an [`ActionRequest`](crate::worker::ActionRequest)
//! and executed on the capture worker; the reply is a single numeric line (see
//! [`protocol`](crate::protocol)). Further connections wait in the listen
//! backlog until the current client sends `close` or disconnects.

use crate::error::CaptureResult;
use crate::protocol::{format_reply, parse_command, reply_for_error, Command, ProtocolError};
use crate::worker::{ActionRequest, WorkerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stops a running [`CommandServer`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerShutdown(Arc<watch::Sender<bool>>);

impl ServerShutdown {
    /// Ask the server to stop. The current client loses its connection at the
    /// next command boundary.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

/// Line-oriented TCP front end for one worker. Clients are served one at a time.
pub struct CommandServer {
    listener: TcpListener,
    worker: WorkerHandle,
    shutdown: Arc<watch::Sender<bool>>,
}

/// What the client loop does after a line.
enum Flow {
    Continue,
    Disconnect,
}

impl CommandServer {
    /// Listen on `addr`. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, worker: WorkerHandle) -> CaptureResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown, _) = watch::channel(false);
        info!(addr = %listener.local_addr()?, "Command server listening");
        Ok(Self {
            listener,
            worker,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> CaptureResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops [`run`](Self::run) from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ServerShutdown {
        ServerShutdown(Arc::clone(&self.shutdown))
    }

    /// Accept and serve clients until shut down by a `shutdown` command or a
    /// [`ServerShutdown`] handle.
    pub async fn run(self) -> CaptureResult<()> {
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                () = stopped(&mut stop) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!(%peer, "Client connected");
                        if let Err(e) = self.serve_client(socket).await {
                            warn!(%peer, error = %e, "Client error");
                        }
                        info!(%peer, "Client disconnected");
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                },
            }
        }
        info!("Command server stopped");
        Ok(())
    }

    async fn serve_client(&self, socket: TcpStream) -> CaptureResult<()> {
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut stop = self.shutdown.subscribe();

        loop {
            let line = tokio::select! {
                () = stopped(&mut stop) => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };

            let (reply, flow) = self.handle_line(&line).await;
            if let Some(code) = reply {
                writer.write_all(format_reply(code).as_bytes()).await?;
                writer.flush().await?;
            }
            if let Flow::Disconnect = flow {
                break;
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> (Option<i64>, Flow) {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(ProtocolError::Empty) => return (None, Flow::Continue),
            Err(e) => {
                warn!(error = %e, "Rejected command");
                return (e.reply_code(), Flow::Continue);
            }
        };
        debug!(?command, "Command received");

        match command {
            Command::Close => (None, Flow::Disconnect),
            Command::Shutdown => {
                info!("Shutdown requested by client");
                self.worker.halt();
                self.shutdown.send_replace(true);
                (None, Flow::Disconnect)
            }
            command => match command.to_request() {
                Ok(Some(request)) => (Some(self.execute(request).await), Flow::Continue),
                Ok(None) => (None, Flow::Continue),
                Err(e) => {
                    warn!(?command, error = %e, "Command rejected");
                    (Some(reply_for_error(&e)), Flow::Continue)
                }
            },
        }
    }

    /// Run `request` on the worker without blocking the runtime.
    async fn execute(&self, request: ActionRequest) -> i64 {
        let worker = self.worker.clone();
        match tokio::task::spawn_blocking(move || worker.execute(request)).await {
            Ok(Ok(outcome)) => {
                debug!(?outcome, "Command complete");
                outcome.reply_code()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Worker rejected request");
                reply_for_error(&e)
            }
            Err(e) => {
                error!(error = %e, "Worker request task failed");
                -1
            }
        }
    }
}

/// Resolves once the shutdown flag is set.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A closed channel means the server is gone; treat it as stopped.
    let _ = stop.wait_for(|stopped| *stopped).await;
}
