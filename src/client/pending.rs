//! Requests waiting for their response.
//!
//! A response is recognized by the topic it arrives on and its tag. Entries
//! must be registered before the request is published so a fast response is
//! never mistaken for a push.

use {
    super::error::NotifyClientError,
    crate::transport::InboundMessage,
    parking_lot::Mutex,
    relay_rpc::domain::Topic,
    std::{collections::HashMap, time::Duration},
    tokio::sync::oneshot,
};

type PendingKey = (Topic, u32);

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: Mutex<HashMap<PendingKey, oneshot::Sender<InboundMessage>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: Topic, tag: u32) -> PendingResponse<'_> {
        let (tx, rx) = oneshot::channel();
        let key = (topic, tag);
        self.waiting.lock().insert(key.clone(), tx);
        PendingResponse {
            requests: self,
            key,
            rx,
        }
    }

    /// Hands `msg` to its waiter. Gives it back when nobody is waiting.
    pub fn resolve(&self, msg: InboundMessage) -> Option<InboundMessage> {
        let waiter = self.waiting.lock().remove(&(msg.topic.clone(), msg.tag));
        match waiter {
            Some(tx) => tx.send(msg).err(),
            None => Some(msg),
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PendingResponse<'a> {
    requests: &'a PendingRequests,
    key: PendingKey,
    rx: oneshot::Receiver<InboundMessage>,
}

impl PendingResponse<'_> {
    pub async fn wait(
        mut self,
        timeout: Duration,
        method: &'static str,
    ) -> Result<InboundMessage, NotifyClientError> {
        let timed_out = || NotifyClientError::Timeout { method, timeout };
        tokio::time::timeout(timeout, &mut self.rx)
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| timed_out())
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.requests.waiting.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::Utc, std::sync::Arc};

    fn inbound(topic: &Topic, tag: u32) -> InboundMessage {
        InboundMessage {
            topic: topic.clone(),
            message: Arc::from("payload"),
            tag,
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn response_reaches_its_waiter() {
        let requests = PendingRequests::new();
        let topic = Topic::generate();
        let pending = requests.register(topic.clone(), 4001);

        assert!(requests.resolve(inbound(&topic, 4001)).is_none());
        let msg = pending.wait(Duration::from_secs(1), "test").await.unwrap();
        assert_eq!(msg.tag, 4001);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn other_tags_and_topics_are_handed_back() {
        let requests = PendingRequests::new();
        let topic = Topic::generate();
        let _pending = requests.register(topic.clone(), 4001);

        assert!(requests.resolve(inbound(&topic, 4012)).is_some());
        assert!(requests.resolve(inbound(&Topic::generate(), 4001)).is_some());
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn timeout_clears_the_entry() {
        let requests = PendingRequests::new();
        let topic = Topic::generate();
        let pending = requests.register(topic.clone(), 4009);

        let result = pending.wait(Duration::from_millis(20), "wc_notifyUpdate").await;
        assert!(matches!(
            result,
            Err(NotifyClientError::Timeout {
                method: "wc_notifyUpdate",
                ..
            })
        ));
        assert!(requests.is_empty());
        // A late response is treated as unsolicited
        assert!(requests.resolve(inbound(&topic, 4009)).is_some());
    }
}
