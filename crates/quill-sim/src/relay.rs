//! In-process token relay with random delivery delays.

use quill_proto::SignedOp;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delivers tokens to every peer except the sender.
///
/// Each delivery sleeps for its own random delay, so peers see tokens in
/// different orders.
#[derive(Debug, Clone)]
pub struct Relay {
    routes: Arc<Vec<(String, mpsc::UnboundedSender<SignedOp>)>>,
    delay_min: Duration,
    delay_max: Duration,
}

impl Relay {
    /// Create a relay and one inbox per peer, in `peers` order.
    #[must_use]
    pub fn new(
        peers: &[String],
        delay_min: Duration,
        delay_max: Duration,
    ) -> (Self, Vec<mpsc::UnboundedReceiver<SignedOp>>) {
        let mut routes = Vec::with_capacity(peers.len());
        let mut inboxes = Vec::with_capacity(peers.len());
        for peer in peers {
            let (tx, rx) = mpsc::unbounded_channel();
            routes.push((peer.clone(), tx));
            inboxes.push(rx);
        }
        let relay = Self {
            routes: Arc::new(routes),
            delay_min,
            delay_max,
        };
        (relay, inboxes)
    }

    /// Send `ops` from `from` to every other peer.
    pub fn send(&self, from: &str, ops: &[SignedOp], rng: &mut StdRng) {
        for (peer, tx) in self.routes.iter() {
            if peer == from {
                continue;
            }
            for op in ops {
                let delay = rng.gen_range(self.delay_min..=self.delay_max);
                let tx = tx.clone();
                let op = op.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Peers that finished their run have dropped their inbox
                    let _ = tx.send(op);
                });
            }
        }
        tracing::trace!(from, ops = ops.len(), "Relayed ops");
    }
}

/// Corrupt one character of the payload segment.
#[must_use]
pub fn tamper(op: &SignedOp, rng: &mut StdRng) -> SignedOp {
    let mut parts: Vec<String> = op.token.split('.').map(str::to_string).collect();
    if let Some(payload) = parts.get_mut(1) {
        let mut chars: Vec<char> = payload.chars().collect();
        if !chars.is_empty() {
            let at = rng.gen_range(0..chars.len());
            chars[at] = if chars[at] == 'x' { 'y' } else { 'x' };
            *payload = chars.into_iter().collect();
        }
    }
    SignedOp::from(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[tokio::test]
    async fn delivers_to_everyone_but_the_sender() {
        let peers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (relay, mut inboxes) =
            Relay::new(&peers, Duration::from_millis(0), Duration::from_millis(2));
        let mut rng = StdRng::seed_from_u64(7);

        relay.send("a", &[SignedOp::from("t".to_string())], &mut rng);

        assert_eq!(inboxes[1].recv().await.unwrap().token, "t");
        assert_eq!(inboxes[2].recv().await.unwrap().token, "t");
        assert!(inboxes[0].try_recv().is_err());
    }

    #[test]
    fn tamper_changes_only_the_payload() {
        let mut rng = StdRng::seed_from_u64(1);
        let op = SignedOp::from("head.payload.sig".to_string());
        let tampered = tamper(&op, &mut rng);

        let parts: Vec<&str> = tampered.token.split('.').collect();
        assert_eq!(parts[0], "head");
        assert_eq!(parts[2], "sig");
        assert_ne!(parts[1], "payload");
        assert_eq!(parts[1].len(), "payload".len());
    }
}
