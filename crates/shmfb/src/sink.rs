//! Human-readable status lines from the publisher and the sweep.

/// Receives one status line at a time. Returns `false` if the line could not be delivered.
pub trait MessageSink: Send {
    fn send(&self, msg: &str) -> bool;
}

impl<F> MessageSink for F
where
    F: Fn(&str) -> bool + Send,
{
    fn send(&self, msg: &str) -> bool {
        self(msg)
    }
}

/// Default sink: one line per message on standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl MessageSink for StderrSink {
    fn send(&self, msg: &str) -> bool {
        eprintln!("{msg}");
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::MessageSink;

    /// Collects every line sent to it.
    #[derive(Clone, Default)]
    pub struct Recorder(pub Arc<Mutex<Vec<String>>>);

    impl Recorder {
        pub fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.lines().iter().any(|l| l.contains(needle))
        }
    }

    impl MessageSink for Recorder {
        fn send(&self, msg: &str) -> bool {
            self.0.lock().unwrap().push(msg.to_string());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink() {
        let sink = |msg: &str| msg.starts_with("ok");
        assert!(sink.send("ok fine"));
        assert!(!sink.send("bad"));
        assert!(StderrSink.send("stderr sink test line"));
    }
}
