//! Network interface abstraction.
//!
//! The supervisor treats the wired and wireless managers uniformly through
//! [`NetworkInterface`]. Shared ownership with teardown-on-last-release is
//! provided by [`SharedInterface`]; the raw socket capability handed to
//! callers is the [`NetClient`] variant type.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{NetError, Result};

/// Which physical interface a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Ethernet => "ETH",
            InterfaceKind::Wireless => "WIFI",
        }
    }
}

/// Wireless signal quality bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl SignalQuality {
    /// Band mapping: POOR below −80 dBm, FAIR −80..−70, GOOD −70..−50,
    /// EXCELLENT at −50 and above.
    pub fn from_rssi(rssi: i16) -> Self {
        if rssi >= -50 {
            SignalQuality::Excellent
        } else if rssi >= -70 {
            SignalQuality::Good
        } else if rssi >= -80 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

/// One managed physical interface.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    fn kind(&self) -> InterfaceKind;

    /// Link up and usable.
    async fn is_connected(&self) -> bool;

    async fn local_ip(&self) -> Option<Ipv4Addr>;

    /// Received signal strength; `None` for wired interfaces.
    async fn rssi(&self) -> Option<i16>;

    /// Release the underlying hardware. Called once, by the last holder.
    fn tear_down(&self);
}

struct Managed {
    iface: Box<dyn NetworkInterface>,
    torn_down: AtomicBool,
}

impl Drop for Managed {
    fn drop(&mut self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            tracing::debug!(kind = self.iface.kind().as_str(), "tearing down interface");
            self.iface.tear_down();
        }
    }
}

/// Shared ownership of an interface manager.
///
/// Clones are cheap handles; the underlying interface is torn down when the
/// last handle is dropped.
#[derive(Clone)]
pub struct SharedInterface {
    inner: Arc<Managed>,
}

impl SharedInterface {
    pub fn new(iface: Box<dyn NetworkInterface>) -> Self {
        Self {
            inner: Arc::new(Managed {
                iface,
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> InterfaceKind {
        self.inner.iface.kind()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.iface.is_connected().await
    }

    pub async fn local_ip(&self) -> Option<Ipv4Addr> {
        self.inner.iface.local_ip().await
    }

    pub async fn rssi(&self) -> Option<i16> {
        self.inner.iface.rssi().await
    }

    /// Number of live holders.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// A raw TCP capability bound to the active interface.
///
/// Publishers that manage their own sockets only need to know which
/// interface is active; components doing raw socket I/O get this variant
/// type with the connect/read/write/close/peek/set-timeout capability set.
pub enum NetClient {
    Ethernet(ClientInner),
    Wireless(ClientInner),
}

/// Connection state shared by both variants.
pub struct ClientInner {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl NetClient {
    pub fn new(kind: InterfaceKind) -> Self {
        let inner = ClientInner {
            stream: None,
            timeout: Duration::from_secs(10),
        };
        match kind {
            InterfaceKind::Ethernet => NetClient::Ethernet(inner),
            InterfaceKind::Wireless => NetClient::Wireless(inner),
        }
    }

    pub fn kind(&self) -> InterfaceKind {
        match self {
            NetClient::Ethernet(_) => InterfaceKind::Ethernet,
            NetClient::Wireless(_) => InterfaceKind::Wireless,
        }
    }

    fn inner(&mut self) -> &mut ClientInner {
        match self {
            NetClient::Ethernet(inner) | NetClient::Wireless(inner) => inner,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.inner().timeout = timeout;
    }

    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let timeout = self.inner().timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| NetError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| NetError::Unavailable(e.to_string()))?;
        self.inner().stream = Some(stream);
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self
            .inner()
            .stream
            .as_mut()
            .ok_or_else(|| NetError::Unavailable("not connected".to_string()))?;
        stream
            .write(data)
            .await
            .map_err(|e| NetError::Unavailable(e.to_string()))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.inner().timeout;
        let stream = self
            .inner()
            .stream
            .as_mut()
            .ok_or_else(|| NetError::Unavailable("not connected".to_string()))?;
        tokio::time::timeout(timeout, stream.read(buf))
            .await
            .map_err(|_| NetError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| NetError::Unavailable(e.to_string()))
    }

    /// Bytes available without consuming them.
    pub async fn peek_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .inner()
            .stream
            .as_mut()
            .ok_or_else(|| NetError::Unavailable("not connected".to_string()))?;
        stream
            .peek(buf)
            .await
            .map_err(|e| NetError::Unavailable(e.to_string()))
    }

    pub fn close(&mut self) {
        self.inner().stream = None;
    }

    pub fn is_connected(&mut self) -> bool {
        self.inner().stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeIface {
        kind: InterfaceKind,
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NetworkInterface for FakeIface {
        fn kind(&self) -> InterfaceKind {
            self.kind
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn local_ip(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(10, 0, 0, 2))
        }
        async fn rssi(&self) -> Option<i16> {
            None
        }
        fn tear_down(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_quality_bands() {
        assert_eq!(SignalQuality::from_rssi(-45), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-50), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-65), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-75), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rssi(-81), SignalQuality::Poor);
    }

    #[tokio::test]
    async fn test_teardown_on_last_release() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let shared = SharedInterface::new(Box::new(FakeIface {
            kind: InterfaceKind::Ethernet,
            teardowns: teardowns.clone(),
        }));

        let second = shared.clone();
        assert_eq!(shared.holders(), 2);
        drop(second);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        drop(shared);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
