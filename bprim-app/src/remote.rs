//! Websocket control channel for an interactive viewer.
//!
//! The server runs on its own tokio runtime thread and talks to the training
//! loop through channels, so the loop never waits on the network: client
//! messages queue up until the next [`poll`], controls and the primitive
//! count are published as latest values, and frames are dropped while the
//! client is still behind. One client at a time; text messages carry JSON,
//! a frame is a JSON header followed by a binary JPEG message.
//!
//! [`poll`]: InteractiveSession::poll

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use bprim_train::ControlState;
use bprim_train::control::ControlUpdate;
use bprim_train::session::{ClientPose, InteractiveSession};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

const JPEG_QUALITY: u8 = 85;
/// Frames waiting for the client; newer frames are skipped beyond this.
const FRAME_QUEUE: usize = 2;
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Set(ControlUpdate),
    Camera { wxyz: [f32; 4], position: [f32; 3] },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Controls { controls: ControlState },
    PrimitiveCount { count: usize },
    Frame { width: u32, height: u32 },
}

#[derive(Debug)]
enum ClientEvent {
    Message(ClientMessage),
    Disconnected,
}

#[derive(Debug)]
struct Frame {
    width: u32,
    height: u32,
    jpeg: Vec<u8>,
}

/// Server side of the channels, shared by connection handlers.
struct Hub {
    events: mpsc::Sender<ClientEvent>,
    /// Held by the connected client; a second client finds it locked.
    frames: Arc<Mutex<mpsc::Receiver<Frame>>>,
    controls: watch::Receiver<Option<ControlState>>,
    count: watch::Receiver<Option<usize>>,
    connected: Arc<AtomicBool>,
}

pub struct RemoteSession {
    // Dropping the runtime stops the server.
    _runtime: Runtime,
    local_addr: SocketAddr,
    events: mpsc::Receiver<ClientEvent>,
    frames: mpsc::Sender<Frame>,
    controls: watch::Sender<Option<ControlState>>,
    count: watch::Sender<Option<usize>>,
    connected: Arc<AtomicBool>,
    pose: Option<ClientPose>,
}

impl RemoteSession {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bprim-viewer")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(tokio::net::TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;

        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (frames, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (controls, controls_rx) = watch::channel(None);
        let (count, count_rx) = watch::channel(None);
        let connected = Arc::new(AtomicBool::new(false));
        let hub = Arc::new(Hub {
            events: event_tx,
            frames: Arc::new(Mutex::new(frame_rx)),
            controls: controls_rx,
            count: count_rx,
            connected: connected.clone(),
        });

        let app = Router::new().route("/", get(upgrade)).with_state(hub);
        runtime.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Viewer server stopped: {}", e);
            }
        });
        info!("Viewer listening on ws://{}", local_addr);

        Ok(Self {
            _runtime: runtime,
            local_addr,
            events,
            frames,
            controls,
            count,
            connected,
            pose: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl InteractiveSession for RemoteSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn poll(&mut self, control: &mut ControlState) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ClientEvent::Message(ClientMessage::Set(update)) => {
                    debug!("Control update {:?}", update);
                    control.apply(update);
                }
                ClientEvent::Message(ClientMessage::Camera { wxyz, position }) => {
                    self.pose = Some(ClientPose::from_wxyz(wxyz, position));
                }
                ClientEvent::Disconnected => self.pose = None,
            }
        }
    }

    fn client_pose(&self) -> Option<ClientPose> {
        self.pose
    }

    fn publish_frame(&mut self, frame: &RgbImage) {
        if !self.is_connected() {
            return;
        }
        let mut jpeg = Vec::new();
        if let Err(e) = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(frame) {
            warn!("Failed to encode frame: {}", e);
            return;
        }
        let frame = Frame {
            width: frame.width(),
            height: frame.height(),
            jpeg,
        };
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Viewer is behind, skipping frame"),
            Err(TrySendError::Closed(_)) => warn!("Viewer server is gone"),
        }
    }

    fn publish_controls(&mut self, control: &ControlState) {
        self.controls.send_if_modified(|sent| {
            if sent.as_ref() == Some(control) {
                return false;
            }
            *sent = Some(control.clone());
            true
        });
    }

    fn set_primitive_count(&mut self, count: usize) {
        self.count.send_if_modified(|sent| {
            if *sent == Some(count) {
                return false;
            }
            *sent = Some(count);
            true
        });
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_client(socket, hub))
}

/// What woke the client task.
enum Wake {
    Incoming(Option<Result<Message, axum::Error>>),
    Controls(bool),
    Count(bool),
    Frame(Option<Frame>),
}

async fn serve_client(mut socket: WebSocket, hub: Arc<Hub>) {
    let Ok(mut frames) = hub.frames.clone().try_lock_owned() else {
        info!("Rejecting viewer: another client is connected");
        socket.send(Message::Close(None)).await.ok();
        return;
    };
    while frames.try_recv().is_ok() {}
    hub.connected.store(true, Ordering::Release);
    info!("Viewer connected");

    let mut controls = hub.controls.clone();
    let mut count = hub.count.clone();
    let initial_controls = controls.borrow_and_update().clone();
    let initial_count = *count.borrow_and_update();
    let mut result: Result<(), axum::Error> = Ok(());
    if let Some(controls) = initial_controls {
        result = send_json(&mut socket, &ServerMessage::Controls { controls }).await;
    }
    if let Some(count) = initial_count.filter(|_| result.is_ok()) {
        result = send_json(&mut socket, &ServerMessage::PrimitiveCount { count }).await;
    }

    while result.is_ok() {
        let wake = tokio::select! {
            incoming = socket.recv() => Wake::Incoming(incoming),
            changed = controls.changed() => Wake::Controls(changed.is_ok()),
            changed = count.changed() => Wake::Count(changed.is_ok()),
            frame = frames.recv() => Wake::Frame(frame),
        };
        result = match wake {
            Wake::Incoming(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(message) => {
                        if hub.events.send(ClientEvent::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed viewer message: {}", e),
                }
                Ok(())
            }
            Wake::Incoming(Some(Ok(Message::Close(_))) | None) => break,
            Wake::Incoming(Some(Ok(_))) => Ok(()),
            Wake::Incoming(Some(Err(e))) => Err(e),
            Wake::Controls(false) | Wake::Count(false) | Wake::Frame(None) => break,
            Wake::Controls(true) => {
                let latest = controls.borrow_and_update().clone();
                match latest {
                    Some(controls) => send_json(&mut socket, &ServerMessage::Controls { controls }).await,
                    None => Ok(()),
                }
            }
            Wake::Count(true) => {
                let latest = *count.borrow_and_update();
                match latest {
                    Some(count) => send_json(&mut socket, &ServerMessage::PrimitiveCount { count }).await,
                    None => Ok(()),
                }
            }
            Wake::Frame(Some(frame)) => send_frame(&mut socket, frame).await,
        };
    }
    if let Err(e) = result {
        debug!("Viewer socket error: {}", e);
    }

    hub.connected.store(false, Ordering::Release);
    hub.events.send(ClientEvent::Disconnected).await.ok();
    info!("Viewer disconnected");
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> Result<(), axum::Error> {
    let header = ServerMessage::Frame {
        width: frame.width,
        height: frame.height,
    };
    send_json(socket, &header).await?;
    socket.send(Message::Binary(frame.jpeg.into())).await
}
