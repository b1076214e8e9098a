//! Packet path from a runner to the channel sink.
//!
//! Every run gets a [`PacketSender`] stamped with the run's generation. The
//! supervisor drains the bounded queue behind it through a [`Forwarder`],
//! which drops anything whose generation is no longer current.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {bytes::Bytes, tokio::sync::mpsc, tracing::warn};

#[cfg(feature = "metrics")]
use livewire_metrics::{counter, packets};

use crate::{
    channel::ChannelKey,
    error::{Error, Result},
    plugin::ChannelSink,
};

/// One emitted payload tagged with the generation of the run that sent it.
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) generation: u64,
    pub(crate) payload: Bytes,
}

/// Handle a [`StreamRunner`](crate::StreamRunner) uses to emit packets.
///
/// Cloneable; all clones belong to the same run.
#[derive(Debug, Clone)]
pub struct PacketSender {
    channel: ChannelKey,
    generation: u64,
    current: Arc<AtomicU64>,
    tx: mpsc::Sender<Packet>,
}

impl PacketSender {
    pub(crate) fn new(
        channel: ChannelKey,
        generation: u64,
        current: Arc<AtomicU64>,
        tx: mpsc::Sender<Packet>,
    ) -> Self {
        Self {
            channel,
            generation,
            current,
            tx,
        }
    }

    /// Queue a payload for delivery. Waits while the queue is full.
    ///
    /// Fails with [`Error::Superseded`] once the run has been stopped or
    /// replaced; runners should treat that as a signal to return.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.is_superseded() {
            return Err(Error::Superseded);
        }
        self.tx
            .send(Packet {
                generation: self.generation,
                payload: payload.into(),
            })
            .await
            .map_err(|_| Error::Superseded)
    }

    /// Whether a newer run (or a stop) has replaced this one.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        self.current.load(Ordering::Acquire) != self.generation
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What happened to a forwarded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forwarded {
    Delivered,
    Stale,
    Failed,
}

/// Moves packets from a run's queue into the sink.
pub(crate) struct Forwarder {
    channel: ChannelKey,
    current: Arc<AtomicU64>,
    sink: Arc<dyn ChannelSink>,
}

impl Forwarder {
    pub(crate) fn new(channel: ChannelKey, current: Arc<AtomicU64>, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            channel,
            current,
            sink,
        }
    }

    pub(crate) async fn forward(&self, packet: Packet) -> Forwarded {
        let current = self.current.load(Ordering::Acquire);
        if packet.generation != current {
            tracing::trace!(
                channel = %self.channel,
                generation = packet.generation,
                current,
                "dropping packet from superseded run"
            );
            #[cfg(feature = "metrics")]
            counter!(packets::DROPPED_STALE_TOTAL).increment(1);
            return Forwarded::Stale;
        }

        #[cfg(feature = "metrics")]
        let len = packet.payload.len() as u64;

        match self.sink.publish(&self.channel, packet.payload).await {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                {
                    counter!(packets::DELIVERED_TOTAL).increment(1);
                    counter!(packets::DELIVERED_BYTES_TOTAL).increment(len);
                }
                Forwarded::Delivered
            },
            Err(e) => {
                let err = Error::Delivery {
                    channel: self.channel.clone(),
                    source: e.into(),
                };
                warn!(channel = %self.channel, error = %err, "packet delivery failed");
                #[cfg(feature = "metrics")]
                counter!(packets::DELIVERY_ERRORS_TOTAL).increment(1);
                Forwarded::Failed
            },
        }
    }
}
