//! Device session setup and the notification receive loop

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::batcher::ConfigDispatcher;
use crate::device::DeviceSession;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Identifiers handed out by the device on registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionIds {
    pub app_id: u32,
    pub stream_id: u64,
}

/// Register the agent and create its config notification stream.
///
/// Registration gets one attempt bounded by `register_timeout`; a failure is
/// fatal. Stream creation is retried per `retry`.
pub async fn establish_session(
    session: &dyn DeviceSession,
    register_timeout: Duration,
    retry: &RetryConfig,
) -> Result<SessionIds> {
    let app_id = match tokio::time::timeout(register_timeout, session.register_agent()).await {
        Ok(Ok(app_id)) => app_id,
        Ok(Err(e)) => return Err(Error::RegistrationError(e.to_string())),
        Err(_) => {
            return Err(Error::RegistrationError(format!(
                "no answer within {:?}",
                register_timeout
            )))
        }
    };

    let stream_id = retry_with_backoff(retry, "create_config_stream", || {
        session.create_config_stream()
    })
    .await
    .map_err(|e| Error::StreamError(format!("could not create config stream: {}", e)))?;

    info!("Registered with app id {} on stream {}", app_id, stream_id);
    Ok(SessionIds { app_id, stream_id })
}

/// Lifecycle of the receive loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    /// Opening (or reopening) the stream
    Subscribing,
    /// Reading messages
    Streaming,
    /// The stream ended or failed for good
    Terminated,
}

/// Reads the notification stream and feeds every item to the dispatcher
pub struct NotificationReceiver {
    session: Arc<dyn DeviceSession>,
    stream_id: u64,
    dispatcher: ConfigDispatcher,
    retry: RetryConfig,
    state: ReceiverState,
}

impl NotificationReceiver {
    pub fn new(
        session: Arc<dyn DeviceSession>,
        stream_id: u64,
        dispatcher: ConfigDispatcher,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            stream_id,
            dispatcher,
            retry,
            state: ReceiverState::Subscribing,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn dispatcher(&self) -> &ConfigDispatcher {
        &self.dispatcher
    }

    /// Receive until the device ends the stream.
    ///
    /// A clean end of stream returns `Ok`. Read errors reopen the stream;
    /// `retry.max_attempts` consecutive failures without a message in between
    /// are fatal, as is a subscription that cannot be reopened.
    pub async fn run(&mut self) -> Result<()> {
        let mut failures = 0u32;

        loop {
            self.state = ReceiverState::Subscribing;
            let session = self.session.clone();
            let stream_id = self.stream_id;
            let opened = retry_with_backoff(&self.retry, "open_notification_stream", || {
                let session = session.clone();
                async move { session.open_stream(stream_id).await }
            })
            .await;

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    self.state = ReceiverState::Terminated;
                    error!("Could not subscribe for notifications: {:?}", e);
                    return Err(Error::StreamError(format!(
                        "could not subscribe to stream {}: {}",
                        stream_id, e
                    )));
                }
            };

            self.state = ReceiverState::Streaming;
            info!("Receiving notifications on stream {}", stream_id);

            loop {
                match stream.next().await {
                    None => {
                        self.state = ReceiverState::Terminated;
                        info!("Notification stream {} ended", stream_id);
                        return Ok(());
                    }
                    Some(Ok(batch)) => {
                        failures = 0;
                        debug!("Received {} notification items", batch.len());
                        for item in batch {
                            if let Err(e) = self.dispatcher.dispatch(item).await {
                                self.state = ReceiverState::Terminated;
                                return Err(e);
                            }
                        }
                    }
                    Some(Err(Error::DecodeError(e))) => {
                        warn!("Skipping undecodable notification message: {}", e);
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        if failures >= self.retry.max_attempts {
                            self.state = ReceiverState::Terminated;
                            error!(
                                "Notification stream {} failed {} times in a row: {:?}",
                                stream_id, failures, e
                            );
                            return Err(Error::StreamError(format!(
                                "stream {} failed {} times: {}",
                                stream_id, failures, e
                            )));
                        }
                        warn!(
                            "Notification stream {} read failed ({}/{}), reconnecting: {:?}",
                            stream_id, failures, self.retry.max_attempts, e
                        );
                        tokio::time::sleep(self.retry.delay_for(failures)).await;
                        break;
                    }
                }
            }
        }
    }
}
