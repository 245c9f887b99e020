// src/alerts.rs
//
// Alert dispatcher boundary. The core hands finalized alerts to a sink;
// delivery (email, webhook, dashboard) lives behind it. A successful hand-off
// moves the alert SUSPECTED -> DISPATCHED; a failed one leaves it SUSPECTED.

use crate::types::{Alert, AlertState};
use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Writes alerts to the log.
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver(&self, alert: &Alert) -> Result<()> {
        info!(
            "📣 ALERT {} visit {} score={:.2} reasons={:?}",
            alert.store_id, alert.visit_id, alert.risk_score, alert.reason_codes
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Forwards alerts to an async consumer over a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelSink {
    fn deliver(&self, alert: &Alert) -> Result<()> {
        let mut delivered = alert.clone();
        delivered.state = AlertState::Dispatched;
        self.tx
            .try_send(delivered)
            .map_err(|e| anyhow!("alert channel rejected visit {}: {}", alert.visit_id, e))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Hand an alert to the sink, updating its state. Returns true on success.
pub fn dispatch(sink: &dyn AlertSink, alert: &mut Alert) -> bool {
    if alert.state == AlertState::Dispatched {
        return true;
    }
    match sink.deliver(alert) {
        Ok(()) => {
            alert.state = AlertState::Dispatched;
            true
        }
        Err(e) => {
            warn!("{} sink failed for visit {}: {:#}", sink.name(), alert.visit_id, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReasonCode, VisitId};

    fn alert() -> Alert {
        Alert {
            store_id: "s1".into(),
            visit_id: VisitId(7),
            risk_score: 0.8,
            reason_codes: [ReasonCode::NoBagEvidence].into_iter().collect(),
            created_ts: 200,
            state: AlertState::Suspected,
        }
    }

    #[test]
    fn test_log_sink_marks_dispatched() {
        let mut a = alert();
        assert!(dispatch(&LogSink, &mut a));
        assert_eq!(a.state, AlertState::Dispatched);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        let mut a = alert();
        assert!(dispatch(&sink, &mut a));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.visit_id, VisitId(7));
        assert_eq!(received.state, AlertState::Dispatched);
    }

    #[test]
    fn test_full_channel_leaves_alert_suspected() {
        let (sink, _rx) = ChannelSink::new(1);
        let mut first = alert();
        let mut second = alert();
        assert!(dispatch(&sink, &mut first));
        assert!(!dispatch(&sink, &mut second));
        assert_eq!(second.state, AlertState::Suspected);
    }
}
