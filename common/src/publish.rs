use log::warn;

use crate::error::PublishError;

/// Broker transport the reconnecting client drives: link probe, full
/// re-establishment (resolve, recreate, re-authenticate), raw send.
pub trait PublishTransport {
    fn connected(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), PublishError>;
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Thin reconnecting pub/sub client. `publish` returns `false` instead of
/// raising; producers treat that as "skip this cycle".
pub struct PublishClient<T> {
    transport: T,
    usable: bool,
}

impl<T: PublishTransport> PublishClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            usable: true,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// An unusable client or dead link is re-established before sending;
    /// a failed send gets one transparent reconnect-and-retry. A second
    /// failure returns `false` and marks the client unusable so the next
    /// caller retries the link first.
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.usable || !self.transport.connected() {
            if let Err(err) = self.transport.reconnect() {
                warn!("broker reconnect failed: {err}");
                self.usable = false;
                return false;
            }
            self.usable = true;
        }

        match self.transport.send(topic, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!("publish to {topic} failed: {err}; reconnecting");
                match self
                    .transport
                    .reconnect()
                    .and_then(|()| self.transport.send(topic, payload))
                {
                    Ok(()) => {
                        self.usable = true;
                        true
                    }
                    Err(err) => {
                        warn!("publish retry to {topic} failed: {err}");
                        self.usable = false;
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeBroker {
        connected: bool,
        fail_sends: u32,
        fail_reconnects: u32,
        sent: Vec<String>,
        reconnects: u32,
    }

    impl PublishTransport for FakeBroker {
        fn connected(&self) -> bool {
            self.connected
        }

        fn reconnect(&mut self) -> Result<(), PublishError> {
            self.reconnects += 1;
            if self.fail_reconnects > 0 {
                self.fail_reconnects -= 1;
                return Err(PublishError::Unreachable("no route".to_string()));
            }
            self.connected = true;
            Ok(())
        }

        fn send(&mut self, topic: &str, _payload: &[u8]) -> Result<(), PublishError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(PublishError::NotConnected);
            }
            self.sent.push(topic.to_string());
            Ok(())
        }
    }

    #[test]
    fn publishes_directly_when_healthy() {
        let mut client = PublishClient::new(FakeBroker {
            connected: true,
            ..FakeBroker::default()
        });

        assert!(client.publish("t", b"x"));
        assert_eq!(client.transport_mut().reconnects, 0);
        assert_eq!(client.transport_mut().sent, vec!["t"]);
    }

    #[test]
    fn dead_link_reconnects_before_sending() {
        let mut client = PublishClient::new(FakeBroker::default());

        assert!(client.publish("t", b"x"));
        assert_eq!(client.transport_mut().reconnects, 1);
    }

    #[test]
    fn failed_send_gets_one_retry_after_reconnect() {
        let mut client = PublishClient::new(FakeBroker {
            connected: true,
            fail_sends: 1,
            ..FakeBroker::default()
        });

        assert!(client.publish("t", b"x"));
        assert_eq!(client.transport_mut().reconnects, 1);
        assert_eq!(client.transport_mut().sent, vec!["t"]);
    }

    #[test]
    fn second_failure_returns_false_and_marks_unusable() {
        let mut client = PublishClient::new(FakeBroker {
            connected: true,
            fail_sends: 2,
            ..FakeBroker::default()
        });

        assert!(!client.publish("t", b"x"));
        assert!(!client.is_usable());
    }

    #[test]
    fn unusable_client_retries_the_link_on_next_call() {
        let mut client = PublishClient::new(FakeBroker {
            connected: true,
            fail_sends: 2,
            ..FakeBroker::default()
        });
        assert!(!client.publish("t", b"x"));

        // The broker recovered; the next cycle goes through.
        assert!(client.publish("t", b"y"));
        assert!(client.is_usable());
    }

    #[test]
    fn reconnect_failure_drops_the_sample() {
        let mut client = PublishClient::new(FakeBroker {
            fail_reconnects: 1,
            ..FakeBroker::default()
        });

        assert!(!client.publish("t", b"x"));
        assert!(client.transport_mut().sent.is_empty());
    }
}
