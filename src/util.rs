use futures::{Sink, SinkExt};
use tokio::sync::mpsc::UnboundedReceiver;

pub trait OptionExt<T> {
    fn ensure(self) -> T;
}

impl<T> OptionExt<T> for Option<T> {
    #[inline]
    fn ensure(self) -> T {
        self.expect("Internal invariant violated")
    }
}

pub trait ResultExt<T> {
    fn ensure(self) -> T;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for Result<T, E> {
    #[inline]
    fn ensure(self) -> T {
        self.expect("Internal invariant violated")
    }
}

/// Generates a trivial [`FromTransport`](crate::protocol::codec::FromTransport)
/// implementation for messages that carry no indexed payload.
#[macro_export]
macro_rules! from_transport {
    (test, $ty:ty) => {
        #[cfg(test)]
        $crate::from_transport!($ty);
    };
    ($ty:ty) => {
        impl $crate::protocol::codec::FromTransport for $ty {
            type Transport = Self;

            fn deserialize(
                source: Self::Transport,
                _frames: &mut $crate::protocol::codec::Frames,
            ) -> Self {
                source
            }
        }
    };
}

/// Generates a trivial [`ToTransport`](crate::protocol::codec::ToTransport)
/// implementation for messages that carry no indexed payload.
#[macro_export]
macro_rules! to_transport {
    (test, $ty:ty) => {
        #[cfg(test)]
        $crate::to_transport!($ty);
    };
    ($ty:ty) => {
        impl $crate::protocol::codec::ToTransport for $ty {
            type Transport = Self;

            fn to_transport(
                self,
                builder: &mut $crate::protocol::codec::MessageBuilder<Self::Transport>,
            ) {
                builder.add_message(self);
            }
        }
    };
}

pub fn setup_interrupt() -> UnboundedReceiver<()> {
    let (end_tx, end_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        log::debug!("Received SIGINT, attempting to stop");
        end_tx
            .send(())
            .unwrap_or_else(|_| log::error!("Sending stop signal failed"))
    })
    .expect("Error setting Ctrl-C handler");
    end_rx
}

pub async fn forward_queue_to_sink<T, E, S: Sink<T, Error = E> + Unpin>(
    mut queue: UnboundedReceiver<T>,
    mut sink: S,
) -> Result<(), E> {
    while let Some(data) = queue.recv().await {
        if let Err(e) = sink.send(data).await {
            log::error!("Forwarding from queue failed");
            return Err(e);
        }
    }
    Ok(())
}
