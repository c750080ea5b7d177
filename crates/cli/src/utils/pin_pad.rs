//! Console PIN pad

use std::{
    io::{self, BufRead},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use portier_terminal::{Pin, PinSource};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

/// PIN source reading one line per evaluation
///
/// Lines are read on a background thread so entry can time out. An empty
/// line is the empty PIN; a timeout or closed input abandons the entry.
/// Only lines typed after the prompt count: anything entered while no card
/// was being evaluated is wiped unread.
#[derive(Debug)]
pub(crate) struct PinPad {
    lines: Receiver<Zeroizing<String>>,
    timeout: Option<Duration>,
}

impl PinPad {
    /// PIN pad on standard input
    pub(crate) fn stdin(timeout: Option<Duration>) -> eyre::Result<Self> {
        Self::spawn(io::BufReader::new(io::stdin()), timeout)
    }

    fn spawn(
        input: impl BufRead + Send + 'static,
        timeout: Option<Duration>,
    ) -> eyre::Result<Self> {
        let (tx, rx) = unbounded();

        thread::Builder::new()
            .name("portier-pin-pad".into())
            .spawn(move || {
                for line in input.lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(Zeroizing::new(line)).is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "PIN pad input failed");
                            break;
                        }
                    }
                }
                trace!("PIN pad input closed");
            })?;

        Ok(Self::new(rx, timeout))
    }

    const fn new(lines: Receiver<Zeroizing<String>>, timeout: Option<Duration>) -> Self {
        Self { lines, timeout }
    }
}

impl PinSource for PinPad {
    fn get_pin(&mut self) -> Option<Pin> {
        let mut stale = 0usize;
        while self.lines.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(lines = stale, "Discarded PIN pad input typed before the prompt");
        }

        eprint!("PIN (empty to skip): ");

        let line = match self.timeout {
            Some(timeout) => self.lines.recv_timeout(timeout),
            None => self
                .lines
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        let line = match line {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                eprintln!();
                warn!("PIN entry timed out");
                return None;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("PIN pad closed");
                return None;
            }
        };

        match Pin::try_from(line.trim()) {
            Ok(pin) => Some(pin),
            Err(error) => {
                warn!(%error, "PIN entry rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::{Sender, unbounded};

    use super::*;

    fn type_later(tx: &Sender<Zeroizing<String>>, line: &str) -> thread::JoinHandle<()> {
        let tx = tx.clone();
        let line = line.to_owned();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = tx.send(Zeroizing::new(line));
        })
    }

    #[test]
    fn test_lines_become_pins() {
        let (tx, rx) = unbounded();
        let mut pad = PinPad::new(rx, Some(Duration::from_secs(5)));

        let typing = type_later(&tx, "1234");
        assert_eq!(pad.get_pin().unwrap().len(), 4);
        typing.join().unwrap();

        let typing = type_later(&tx, "");
        assert!(pad.get_pin().unwrap().is_empty());
        typing.join().unwrap();

        let typing = type_later(&tx, " 987654 ");
        assert_eq!(pad.get_pin().unwrap().len(), 6);
        typing.join().unwrap();

        drop(tx);
        assert!(pad.get_pin().is_none());
    }

    #[test]
    fn test_late_entry_is_not_reused() {
        let (tx, rx) = unbounded();
        let mut pad = PinPad::new(rx, Some(Duration::from_millis(20)));
        assert!(pad.get_pin().is_none());

        // Typed after the entry timed out, before the next card
        tx.send(Zeroizing::new("1234".to_owned())).unwrap();
        tx.send(Zeroizing::new("5678".to_owned())).unwrap();

        pad.timeout = Some(Duration::from_secs(5));
        let typing = type_later(&tx, "");
        let pin = pad.get_pin().unwrap();
        assert!(pin.is_empty());
        typing.join().unwrap();
        assert!(pad.lines.is_empty());
    }

    #[test]
    fn test_overlong_entry_is_abandoned() {
        let (tx, rx) = unbounded();
        let mut pad = PinPad::new(rx, Some(Duration::from_secs(5)));
        let typing = type_later(&tx, "12345678901234567890");
        assert!(pad.get_pin().is_none());
        typing.join().unwrap();
    }

    #[test]
    fn test_entry_times_out() {
        let (_tx, rx) = unbounded();
        let mut pad = PinPad::new(rx, Some(Duration::from_millis(20)));
        assert!(pad.get_pin().is_none());
    }
}
