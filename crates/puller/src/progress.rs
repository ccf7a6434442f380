//! Human readable progress events emitted while pulling.
//!
//! The wording of the actions ("Downloading", "Verifying Checksum",
//! "Download complete", "Pulling from", "Digest:", "Status:") is parsed by
//! tooling and must not change.
use std::fmt;

use tokio::sync::mpsc;

/// A single progress event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// The short identifier the event is about, usually a layer short ID or a
    /// tag. Empty for general messages.
    pub id: String,
    /// The action label, for example `Downloading`.
    pub action: String,
    /// Free form text. Takes precedence over `action` when set.
    pub message: String,
    /// Bytes transferred so far.
    pub current: u64,
    /// Total bytes, when known.
    pub total: Option<u64>,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.id.is_empty() {
            write!(f, "{}: ", self.id)?;
        }
        if !self.message.is_empty() {
            return write!(f, "{}", self.message);
        }
        write!(f, "{}", self.action)?;
        match self.total {
            Some(total) if self.current > 0 => write!(f, " {}/{}", self.current, total),
            None if self.current > 0 => write!(f, " {}", self.current),
            _ => Ok(()),
        }
    }
}

/// A sink for progress events.
pub trait ProgressOutput: Send + Sync {
    /// Delivers one event. Sinks never fail a pull.
    fn write_progress(&self, progress: Progress);
}

/// Emits a free form message.
pub fn message(out: &dyn ProgressOutput, id: &str, message: impl Into<String>) {
    out.write_progress(Progress {
        id: id.to_owned(),
        message: message.into(),
        ..Default::default()
    })
}

/// Emits a formatted free form message.
#[macro_export]
macro_rules! messagef {
    ($out:expr, $id:expr, $($arg:tt)*) => {
        $crate::progress::message($out, $id, format!($($arg)*))
    };
}

pub use crate::messagef;

/// Emits an action with no byte counts.
pub fn update(out: &dyn ProgressOutput, id: &str, action: &str) {
    out.write_progress(Progress {
        id: id.to_owned(),
        action: action.to_owned(),
        ..Default::default()
    })
}

/// Emits a transfer update.
pub fn bytes(out: &dyn ProgressOutput, id: &str, action: &str, current: u64, total: Option<u64>) {
    out.write_progress(Progress {
        id: id.to_owned(),
        action: action.to_owned(),
        current,
        total,
        ..Default::default()
    })
}

/// Forwards events to an unbounded channel.
#[derive(Clone)]
pub struct ChannelOutput {
    sender: mpsc::UnboundedSender<Progress>,
}

impl ChannelOutput {
    /// Creates the sink together with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelOutput { sender }, receiver)
    }
}

impl ProgressOutput for ChannelOutput {
    fn write_progress(&self, progress: Progress) {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.sender.send(progress);
    }
}

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl ProgressOutput for Discard {
    fn write_progress(&self, _progress: Progress) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_events() {
        let p = Progress {
            id: "0123456789ab".to_owned(),
            action: "Downloading".to_owned(),
            current: 10,
            total: Some(20),
            ..Default::default()
        };
        assert_eq!("0123456789ab: Downloading 10/20", p.to_string());

        let p = Progress {
            message: "Status: Image is up to date for app:v1".to_owned(),
            ..Default::default()
        };
        assert_eq!("Status: Image is up to date for app:v1", p.to_string());

        let p = Progress {
            id: "v1".to_owned(),
            action: "Pulling fs layer".to_owned(),
            ..Default::default()
        };
        assert_eq!("v1: Pulling fs layer", p.to_string());
    }

    #[tokio::test]
    async fn channel_output_delivers_in_order() {
        let (out, mut rx) = ChannelOutput::new();
        update(&out, "abc", "Waiting");
        messagef!(&out, "", "Digest: {}", "sha256:1234");
        bytes(&out, "abc", "Downloading", 5, None);
        drop(out);

        let mut seen = Vec::new();
        while let Some(p) = rx.recv().await {
            seen.push(p.to_string());
        }
        assert_eq!(
            vec!["abc: Waiting", "Digest: sha256:1234", "abc: Downloading 5"],
            seen
        );
    }
}
