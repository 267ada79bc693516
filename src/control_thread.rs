use crate::fault_injection::control::{Command, ControlError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use std::io::BufRead;
use std::thread::{spawn, JoinHandle};

/// Reads control commands line by line and forwards them to the campaign loop.
///
/// Parsing happens on the reader thread; only parsed commands (or their
/// parse errors) cross the channel. The campaign loop stays the only writer
/// of the fault engine.
pub struct ControlThread {
    receiver: Receiver<Result<Command, ControlError>>,
    handle: JoinHandle<()>,
}

impl ControlThread {
    /// Starts reading from stdin. The lock is taken on the reader thread.
    pub fn from_stdin() -> Self {
        Self::spawn_reader(|| Box::new(std::io::stdin().lock()) as Box<dyn BufRead>)
    }

    /// Starts reading from any line source, mainly for scripted runs.
    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        Self::spawn_reader(move || Box::new(reader) as Box<dyn BufRead>)
    }

    fn spawn_reader<F>(open: F) -> Self
    where
        F: FnOnce() -> Box<dyn BufRead> + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let handle = spawn(move || forward_lines(open(), &sender));
        Self { receiver, handle }
    }

    /// Commands received since the last call, in order. Never blocks.
    pub fn drain(&self) -> Vec<Result<Command, ControlError>> {
        self.receiver.try_iter().collect()
    }

    /// True once the reader reached end of input and everything was drained.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished() && self.receiver.is_empty()
    }
}

fn forward_lines<R: BufRead>(reader: R, sender: &Sender<Result<Command, ControlError>>) {
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if sender.send(Command::parse(&line)).is_err() {
            break;
        }
    }
    debug!("Control input closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    #[test]
    fn forwards_parsed_commands_in_order() {
        let input = Cursor::new("en 1\n\narm rx every 5\nbogus\n");
        let control = ControlThread::from_reader(input);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.len() < 3 && Instant::now() < deadline {
            received.extend(control.drain());
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0], Ok(Command::Enable(true)));
        assert!(matches!(received[1], Ok(Command::ArmEveryN { n: 5, .. })));
        assert!(matches!(received[2], Err(ControlError::UnknownCommand(_))));
    }

    #[test]
    fn finishes_after_input_is_drained() {
        let control = ControlThread::from_reader(Cursor::new("dump
"));
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while !control.is_finished() && Instant::now() < deadline {
            received.extend(control.drain());
        }
        assert!(control.is_finished());
        assert_eq!(received, vec![Ok(Command::DumpCounters)]);
    }
}
