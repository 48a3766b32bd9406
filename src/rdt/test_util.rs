// rdt/test_util.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::Level;

use crate::rdt::common::TransferError;
use crate::rdt::link::Link;
use crate::rdt::packet::Message;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

type LossFn = Box<dyn FnMut(&Message) -> bool + Send>;

/// In-memory link. Outbound messages for which the loss function returns
/// true never reach the peer.
pub struct MemLink {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    loss: Mutex<Option<LossFn>>,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl MemLink {
    pub fn pair() -> (MemLink, MemLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (MemLink::new(a_tx, b_rx), MemLink::new(b_tx, a_rx))
    }

    /// A link whose peer never answers
    pub fn silent() -> MemLink {
        let (tx, _) = mpsc::unbounded_channel();
        let (_, rx) = mpsc::unbounded_channel();
        MemLink::new(tx, rx)
    }

    fn new(tx: mpsc::UnboundedSender<Message>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { tx, rx, loss: Mutex::new(None), sent: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn with_loss(self, loss: impl FnMut(&Message) -> bool + Send + 'static) -> Self {
        *self.loss.lock().unwrap() = Some(Box::new(loss));
        self
    }

    /// Everything this side attempted to send, lost or not
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Message>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Link for MemLink {
    async fn send(&self, msg: &Message) -> Result<(), TransferError> {
        self.sent.lock().unwrap().push(msg.clone());
        let lost = match self.loss.lock().unwrap().as_mut() {
            Some(loss) => loss(msg),
            None => false,
        };
        if !lost {
            // Peer already gone is indistinguishable from loss
            let _ = self.tx.send(msg.clone());
        }
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, TransferError> {
        match timeout(wait, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => {
                // Closed channel would otherwise return instantly
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }
}
