//! Background execution of camera motion requests

use std::sync::{Arc, Mutex};
use std::thread;

use flume::{Receiver, Sender, TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::camera::MotionController;
use crate::error::DispatchError;
use crate::pipeline::events::EventBus;
use crate::records::{EventPayload, FocusRecord, PtzRecord, ServerEvent};
use crate::utils::lock;

/// Requests accepted from clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionRequest {
    Ptz(PtzRecord),
    Focus(FocusRecord),
    Reset,
}

impl MotionRequest {
    fn payload(self) -> EventPayload {
        match self {
            MotionRequest::Ptz(record) => record.into(),
            MotionRequest::Focus(record) => record.into(),
            MotionRequest::Reset => EventPayload::Message("reset".into()),
        }
    }
}

struct Job {
    request: MotionRequest,
    done: oneshot::Sender<Vec<String>>,
}

/// Resolves to the failures of an executed request.
///
/// Dropping it is fine; the request still runs.
pub struct Ticket(oneshot::Receiver<Vec<String>>);

impl Ticket {
    pub async fn wait(self) -> Result<Vec<String>, DispatchError> {
        self.0.await.map_err(|_| DispatchError::Closed)
    }
}

/// What clients last asked for, recorded on acceptance
#[derive(Debug, Clone, Copy, Default)]
struct Commanded {
    ptz: PtzRecord,
    focus: FocusRecord,
}

impl Commanded {
    fn record(&mut self, request: MotionRequest) {
        match request {
            MotionRequest::Ptz(record) => self.ptz = record,
            MotionRequest::Focus(FocusRecord { auto, value }) => {
                self.focus.auto = auto;
                if value.is_some() {
                    self.focus.value = value;
                }
            }
            MotionRequest::Reset => {}
        }
    }
}

/// Single-consumer work queue in front of a [`MotionController`].
///
/// Requests run one at a time on a dedicated thread, so hardware writes
/// never interleave. The event for a request is published after it ran.
/// Commanded PTZ and focus are readable as soon as a request is accepted,
/// without waiting on the hardware.
pub struct MotionDispatcher {
    tx: Sender<Job>,
    commanded: Mutex<Commanded>,
}

impl MotionDispatcher {
    pub fn spawn(
        controller: Arc<Mutex<MotionController>>,
        events: EventBus,
        depth: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = flume::bounded(depth.max(1));
        thread::Builder::new()
            .name("motion-worker".into())
            .spawn(move || worker(rx, controller, events))?;
        Ok(Self {
            tx,
            commanded: Mutex::default(),
        })
    }

    /// Queue a request. Fails only when the queue is full or the worker died.
    pub fn submit(&self, request: MotionRequest) -> Result<Ticket, DispatchError> {
        let (done, ticket) = oneshot::channel();
        // held across the send so recorded state follows queue order
        let mut commanded = lock(&self.commanded);
        match self.tx.try_send(Job { request, done }) {
            Ok(()) => {
                commanded.record(request);
                Ok(Ticket(ticket))
            }
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }

    /// Last accepted PTZ request
    pub fn ptz(&self) -> PtzRecord {
        lock(&self.commanded).ptz
    }

    /// Last accepted focus request; an absent value keeps the previous one.
    pub fn focus(&self) -> FocusRecord {
        lock(&self.commanded).focus
    }
}

fn worker(rx: Receiver<Job>, controller: Arc<Mutex<MotionController>>, events: EventBus) {
    info!("Motion worker started");
    while let Ok(Job { request, done }) = rx.recv() {
        debug!(?request, "Executing motion request");
        let errors = {
            let mut controller = lock(&controller);
            match request {
                MotionRequest::Ptz(PtzRecord { pan, tilt, zoom }) => controller.set_ptz(pan, tilt, zoom),
                MotionRequest::Focus(FocusRecord { auto, value }) => controller.focus(auto, value),
                MotionRequest::Reset => controller.reset(),
            }
        };
        for error in &errors {
            warn!("{error}");
        }

        events.publish(ServerEvent::new(request.payload()));
        // nobody waiting is the normal case for HTTP callers
        let _ = done.send(errors);
    }
    info!("Motion worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::motion::controls::tests::{integer, FakeSurface};
    use crate::motion::controls::{V4L2_CID_PAN_RELATIVE, V4L2_CID_ZOOM_ABSOLUTE};

    fn dispatcher(surface: FakeSurface, events: &EventBus) -> (MotionDispatcher, Arc<Mutex<MotionController>>) {
        let controller = Arc::new(Mutex::new(MotionController::new(Box::new(surface))));
        let dispatcher = MotionDispatcher::spawn(controller.clone(), events.clone(), 4).unwrap();
        (dispatcher, controller)
    }

    #[tokio::test]
    async fn test_ticket_reports_errors_and_event_follows() {
        let surface = FakeSurface::with(vec![integer(V4L2_CID_ZOOM_ABSOLUTE, "Zoom, Absolute", 0, 10, 0)]);
        let events = EventBus::new(8);
        let (dispatcher, controller) = dispatcher(surface, &events);

        let ticket = dispatcher
            .submit(MotionRequest::Ptz(PtzRecord { pan: 1, tilt: 2, zoom: 3 }))
            .unwrap();
        let errors = ticket.wait().await.unwrap();

        // no pan or tilt controls on this camera
        assert_eq!(errors.len(), 2);
        assert_eq!(controller.lock().unwrap().ptz(), PtzRecord { pan: 1, tilt: 2, zoom: 3 });

        let event = events.try_consume().unwrap();
        assert_eq!(event.event_type(), "PTZRecord");
        assert!(events.try_consume().is_none());
    }

    #[tokio::test]
    async fn test_requests_run_in_submission_order() {
        let surface = FakeSurface::with(vec![integer(V4L2_CID_PAN_RELATIVE, "Pan, Relative", -9, 9, 0)]);
        let events = EventBus::new(8);
        let (dispatcher, _) = dispatcher(surface.clone(), &events);

        let tickets: Vec<_> = (1..=3)
            .map(|pan| dispatcher.submit(MotionRequest::Ptz(PtzRecord { pan, tilt: 0, zoom: 0 })).unwrap())
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let pans: Vec<i64> = surface
            .writes()
            .into_iter()
            .filter(|(id, _)| *id == V4L2_CID_PAN_RELATIVE)
            .map(|(_, v)| v)
            .collect();
        assert_eq!(pans, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reset_publishes_message() {
        let events = EventBus::new(8);
        let (dispatcher, _) = dispatcher(FakeSurface::default(), &events);

        let errors = dispatcher.submit(MotionRequest::Reset).unwrap().wait().await.unwrap();
        assert_eq!(errors.len(), 1);

        let event = events.try_consume().unwrap();
        assert_eq!(event.data.payload, EventPayload::Message("reset".into()));
    }

    #[tokio::test]
    async fn test_commanded_state_is_recorded_on_acceptance() {
        let events = EventBus::new(8);
        let (dispatcher, controller) = dispatcher(FakeSurface::default(), &events);

        // park the worker on its first request
        let held = controller.lock().unwrap();
        let first = PtzRecord { pan: 1, tilt: 1, zoom: 1 };
        dispatcher.submit(MotionRequest::Ptz(first)).unwrap();
        assert_eq!(dispatcher.ptz(), first);
        while !dispatcher.tx.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher
            .submit(MotionRequest::Focus(FocusRecord { auto: false, value: Some(40) }))
            .unwrap();
        dispatcher
            .submit(MotionRequest::Focus(FocusRecord { auto: true, value: None }))
            .unwrap();
        dispatcher.submit(MotionRequest::Reset).unwrap();
        dispatcher.submit(MotionRequest::Ptz(PtzRecord { pan: 7, tilt: 7, zoom: 7 })).unwrap();

        // queue of four is full now
        let rejected = dispatcher.submit(MotionRequest::Ptz(PtzRecord { pan: 9, tilt: 9, zoom: 9 }));
        assert!(matches!(rejected, Err(DispatchError::QueueFull)));

        assert_eq!(dispatcher.ptz(), PtzRecord { pan: 7, tilt: 7, zoom: 7 });
        assert_eq!(dispatcher.focus(), FocusRecord { auto: true, value: Some(40) });
        // nothing has reached the hardware yet
        assert_eq!(held.ptz(), PtzRecord::default());
        drop(held);
    }
}
