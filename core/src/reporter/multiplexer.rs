use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use crate::event::BuildEvent;
use crate::result::LaunchResult;

use super::{FaultPhase, Reporter, ReporterError, ReporterFault};

struct Slot {
    reporter: Box<dyn Reporter>,
    fault: Option<ReporterFault>,
}

/// Ordered fan-out of events to a fixed set of reporters.
///
/// Every reporter sees every event, in registration order. A reporter that
/// returns an error or panics keeps receiving later events; only its first
/// fault is recorded.
pub struct ReporterMultiplexer {
    slots: Vec<Slot>,
    finished: bool,
}

impl ReporterMultiplexer {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            slots: reporters
                .into_iter()
                .map(|reporter| Slot {
                    reporter,
                    fault: None,
                })
                .collect(),
            finished: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn reporter_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.reporter.name().to_string())
            .collect()
    }

    pub fn deliver(&mut self, event: &BuildEvent) {
        if self.finished {
            tracing::warn!(seq = event.seq, kind = %event.kind, "event delivered after finish, dropping");
            return;
        }

        for slot in &mut self.slots {
            let outcome = absorb_panics(|| slot.reporter.on_event(event));
            if let Some(message) = fault_message(outcome) {
                record_fault(slot, FaultPhase::Event, Some(event.seq), message);
            }
        }
    }

    /// Calls every reporter's finish hook once. Later calls do nothing.
    pub fn finish(&mut self, result: &LaunchResult) {
        if self.finished {
            return;
        }
        self.finished = true;

        for slot in &mut self.slots {
            let outcome = absorb_panics(|| slot.reporter.on_finish(result));
            if let Some(message) = fault_message(outcome) {
                record_fault(slot, FaultPhase::Finish, None, message);
            }
        }
    }

    pub fn faults(&self) -> Vec<ReporterFault> {
        self.slots.iter().filter_map(|slot| slot.fault.clone()).collect()
    }
}

thread_local! {
    static ABSORBING: Cell<bool> = Cell::new(false);
}

static QUIET_HOOK: Once = Once::new();

/// Wraps the process panic hook so panics caught by [`absorb_panics`] are
/// logged at debug level instead of printed to stderr. Other panics still
/// reach the previous hook.
fn install_quiet_hook() {
    QUIET_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ABSORBING.with(Cell::get) {
                tracing::debug!(%info, "reporter panicked");
            } else {
                previous(info);
            }
        }));
    });
}

fn absorb_panics<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    install_quiet_hook();
    let was_absorbing = ABSORBING.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    ABSORBING.with(|flag| flag.set(was_absorbing));
    outcome
}

fn fault_message(
    outcome: Result<Result<(), ReporterError>, Box<dyn Any + Send>>,
) -> Option<String> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    }
}

fn record_fault(slot: &mut Slot, phase: FaultPhase, sequence: Option<u64>, message: String) {
    match &mut slot.fault {
        Some(fault) => fault.suppressed += 1,
        None => {
            let fault = ReporterFault {
                reporter: slot.reporter.name().to_string(),
                phase,
                sequence,
                message,
                suppressed: 0,
            };
            tracing::warn!("{}", fault);
            slot.fault = Some(fault);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: String,
        log: Log,
        fail_on: Option<u64>,
        panic_on: Option<u64>,
    }

    impl Recording {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                name: name.to_string(),
                log: log.clone(),
                fail_on: None,
                panic_on: None,
            }
        }
    }

    impl Reporter for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError> {
            if self.panic_on == Some(event.seq) {
                panic!("boom at {}", event.seq);
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.seq));
            if self.fail_on.map_or(false, |n| event.seq >= n) {
                return Err(ReporterError::Other("broken pipe".to_string()));
            }
            Ok(())
        }

        fn on_finish(&mut self, _result: &LaunchResult) -> Result<(), ReporterError> {
            self.log.lock().unwrap().push(format!("{}:finish", self.name));
            Ok(())
        }
    }

    fn event(seq: u64) -> BuildEvent {
        BuildEvent::new(EventKind::Message, seq).with("text", "x")
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let log = Log::default();
        let mut mux = ReporterMultiplexer::new(vec![
            Box::new(Recording::new("a", &log)),
            Box::new(Recording::new("b", &log)),
        ]);

        mux.deliver(&event(0));
        mux.deliver(&event(1));
        mux.finish(&LaunchResult::succeeded(0.0));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:0", "b:0", "a:1", "b:1", "a:finish", "b:finish"]
        );
        assert!(mux.faults().is_empty());
    }

    #[test]
    fn test_error_is_isolated_and_first_fault_wins() {
        let log = Log::default();
        let mut failing = Recording::new("a", &log);
        failing.fail_on = Some(1);
        let mut mux = ReporterMultiplexer::new(vec![
            Box::new(failing),
            Box::new(Recording::new("b", &log)),
        ]);

        for seq in 0..4 {
            mux.deliver(&event(seq));
        }

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| l.starts_with("b:")).count(), 4);
        assert_eq!(log.iter().filter(|l| l.starts_with("a:")).count(), 4);

        let faults = mux.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].reporter, "a");
        assert_eq!(faults[0].sequence, Some(1));
        assert_eq!(faults[0].suppressed, 2);
    }

    #[test]
    fn test_panic_is_isolated() {
        let log = Log::default();
        let mut panicking = Recording::new("a", &log);
        panicking.panic_on = Some(0);
        let mut mux = ReporterMultiplexer::new(vec![
            Box::new(panicking),
            Box::new(Recording::new("b", &log)),
        ]);

        mux.deliver(&event(0));
        mux.deliver(&event(1));

        assert_eq!(*log.lock().unwrap(), vec!["b:0", "a:1", "b:1"]);
        let faults = mux.faults();
        assert_eq!(faults[0].message, "panicked: boom at 0");
        assert_eq!(faults[0].phase, FaultPhase::Event);
        assert!(!ABSORBING.with(Cell::get));
    }

    #[test]
    fn test_absorbed_panics_are_scoped_to_the_call() {
        let outcome = absorb_panics(|| -> u32 { panic!("quiet") });
        assert!(outcome.is_err());
        assert!(!ABSORBING.with(Cell::get));

        assert_eq!(absorb_panics(|| ABSORBING.with(Cell::get)).unwrap(), true);
        assert!(!ABSORBING.with(Cell::get));
    }

    #[test]
    fn test_finish_runs_once() {
        let log = Log::default();
        let mut mux = ReporterMultiplexer::new(vec![Box::new(Recording::new("a", &log))]);

        mux.finish(&LaunchResult::succeeded(0.0));
        mux.finish(&LaunchResult::succeeded(0.0));
        mux.deliver(&event(5));

        assert_eq!(*log.lock().unwrap(), vec!["a:finish"]);
        assert!(mux.is_finished());
    }
}
