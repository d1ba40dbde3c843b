//! Microphone capture seam.
//!
//! The session acquires a stream of captured sample chunks at the outbound
//! rate and releases it on teardown. In the server the "microphone" lives in
//! the browser: `RelayMicrophone` turns the samples posted over the UI socket
//! into that stream.

use crate::error::ConsultationError;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Start capture at `sample_rate`. Fails with `Acquisition` when the
    /// device is unavailable, denied, or cannot capture at that rate.
    async fn acquire(
        &self,
        sample_rate: u32,
    ) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, ConsultationError>;

    /// Stop capture. Safe to call repeatedly and without a prior `acquire`.
    async fn release(&self);
}

/// Microphone fed by samples relayed from a remote client.
#[derive(Debug)]
pub struct RelayMicrophone {
    capture_rate: Option<u32>,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
}

impl RelayMicrophone {
    /// `capture_rate` is what the client announced; `None` means the client
    /// never granted microphone access.
    pub fn new(capture_rate: Option<u32>) -> Self {
        Self {
            capture_rate,
            sender: Mutex::new(None),
        }
    }

    /// Forward one captured chunk. Returns `false` when nobody is listening.
    pub fn feed(&self, samples: Vec<f32>) -> bool {
        let Ok(guard) = self.sender.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(sender) => sender.send(samples).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.sender
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Microphone for RelayMicrophone {
    async fn acquire(
        &self,
        sample_rate: u32,
    ) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, ConsultationError> {
        let capture_rate = self.capture_rate.ok_or_else(|| {
            ConsultationError::Acquisition("client did not grant microphone access".to_string())
        })?;
        if capture_rate != sample_rate {
            return Err(ConsultationError::Acquisition(format!(
                "client captures at {} Hz but the session needs {} Hz",
                capture_rate, sample_rate
            )));
        }

        let mut guard = self.sender.lock().map_err(|_| {
            ConsultationError::Acquisition("microphone state is unavailable".to_string())
        })?;
        if guard.is_some() {
            return Err(ConsultationError::Acquisition(
                "microphone is already in use".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        debug!(sample_rate, "Relay microphone acquired");
        Ok(rx)
    }

    async fn release(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            if guard.take().is_some() {
                debug!("Relay microphone released");
            }
        }
    }
}
