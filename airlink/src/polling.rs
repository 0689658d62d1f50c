use anyhow::{Context, Result};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::time::Duration;

pub struct Poller {
    inner: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        let inner = Poll::new().context("Error creating poller")?;
        let events = Events::with_capacity(capacity);
        Ok(Self {
            inner,
            events,
        })
    }

    pub fn register<S: Source>(&mut self, source: &mut S, token: Token, interest: Interest) -> Result<()> {
        self.inner.registry().register(source, token, interest).context("Error registering event source")
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<&Events> {
        self.inner.poll(&mut self.events, timeout).context("Error polling for events")?;
        Ok(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;

    #[test]
    fn wakes_on_readable_datagram() {
        let mut receiver = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = receiver.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut poller = Poller::new(4).unwrap();
        poller.register(&mut receiver, Token(0), Interest::READABLE).unwrap();

        // Timeout path first: nothing readable yet.
        let events = poller.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());

        sender.send_to(b"ping", local).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            let events = poller.poll(Some(Duration::from_millis(20))).unwrap();
            if !events.is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no readiness event");
        }
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
