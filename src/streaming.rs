use futures::{Future, Stream};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Sleep};

#[derive(Debug)]
pub enum StreamError<E> {
    Timeout,
    Inner(E),
}

/// Fails with [`StreamError::Timeout`] when the inner stream stays idle
/// for longer than `timeout` between two items.
#[pin_project]
pub struct TimeoutStream<S>
where
    S: Stream,
{
    #[pin]
    inner: S,
    timeout: Duration,
    #[pin]
    timer: Option<Sleep>,
}

impl<S> TimeoutStream<S>
where
    S: Stream,
{
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            timer: None,
        }
    }
}

impl<S, T, E> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, StreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if this.timer.is_none() {
            this.timer.set(Some(sleep(*this.timeout)));
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                this.timer.set(Some(sleep(*this.timeout)));
                return Poll::Ready(Some(item.map_err(StreamError::Inner)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if let Some(timer) = this.timer.as_mut().as_pin_mut() {
            if timer.poll(cx).is_ready() {
                return Poll::Ready(Some(Err(StreamError::Timeout)));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn ready_items_pass_through() {
        let inner = futures::stream::iter(vec![Ok::<_, String>(1), Err("bad".to_string())]);
        let mut stream = std::pin::pin!(TimeoutStream::new(inner, Duration::from_millis(50)));

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(StreamError::Inner(ref msg)) if msg == "bad"
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let inner = futures::stream::pending::<Result<u8, String>>();
        let mut stream = std::pin::pin!(TimeoutStream::new(inner, Duration::from_millis(20)));

        assert!(matches!(
            stream.next().await,
            Some(Err(StreamError::Timeout))
        ));
    }
}
