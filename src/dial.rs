//! Backend dialing: direct TCP, optional SOCKS5 chaining, the preset
//! allow-list, and the deadline-extending timeout stream.

use std::collections::HashSet;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::{sleep, timeout, Sleep},
};
use tracing::debug;

/// How many deadline re-arms one prompt grant buys. With the default
/// 5 s dial timeout this bounds a prompt wait to an hour.
const EXTENSION_LIMIT: u32 = 720;

/// Sentinel meaning the read deadline is disarmed for good.
const UNLIMITED: u32 = u32::MAX;

/// A bounded budget of read-deadline extensions, shared between the
/// prompt owner and the connection's reader.
///
/// The owner grants extensions before suspending on a user prompt and
/// settles back down afterwards; the reader consumes one unit per
/// expired deadline, atomically. The deadline machinery only guards
/// the dial and prompt phase: once the session is established the
/// owner disarms the budget and reads become unbounded.
#[derive(Clone, Debug, Default)]
pub struct DeadlineBudget(Arc<AtomicU32>);

impl DeadlineBudget {
    /// An empty budget: the first expired deadline is fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the full extension budget; called before waiting on a
    /// user prompt.
    pub fn grant(&self) {
        self.0.store(EXTENSION_LIMIT, Ordering::Release);
    }

    /// Drops back to a single extension once the prompt is answered,
    /// so a read already sitting on an expired deadline recovers once.
    pub fn settle(&self) {
        self.0.store(1, Ordering::Release);
    }

    /// Disables the read deadline permanently; called once the
    /// session is established.
    pub fn disarm(&self) {
        self.0.store(UNLIMITED, Ordering::Release);
    }

    /// Whether the deadline has been disarmed.
    pub(crate) fn is_disarmed(&self) -> bool {
        self.0.load(Ordering::Acquire) == UNLIMITED
    }

    /// Consumes one extension if any remain. A disarmed budget always
    /// extends without draining.
    pub(crate) fn try_consume(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == UNLIMITED {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_ok()
    }
}

/// An `AsyncRead`/`AsyncWrite` wrapper with re-arming deadlines.
///
/// A read deadline is armed when a read goes pending and cleared when
/// it completes; on expiry the stream consumes one unit from its
/// [`DeadlineBudget`] and re-arms, or fails with `TimedOut`. Writes
/// get a per-attempt deadline with no extension. A zero duration, or
/// a disarmed budget, disables the respective deadline.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
    budget: DeadlineBudget,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutStream<S> {
    /// Wraps `stream` with the given deadlines and extension budget.
    pub fn new(
        stream: S,
        read_timeout: Duration,
        write_timeout: Duration,
        budget: DeadlineBudget,
    ) -> Self {
        Self {
            stream,
            read_timeout,
            write_timeout,
            budget,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// The wrapped stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match Pin::new(&mut me.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                me.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if me.read_timeout.is_zero() || me.budget.is_disarmed() {
                    me.read_deadline = None;
                    return Poll::Pending;
                }
                loop {
                    let deadline = me
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(sleep(me.read_timeout)));
                    match deadline.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(()) => {
                            me.read_deadline = None;
                            if !me.budget.try_consume() {
                                return Poll::Ready(Err(ErrorKind::TimedOut.into()));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.stream).poll_write(cx, buf) {
            Poll::Ready(result) => {
                me.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if me.write_timeout.is_zero() {
                    return Poll::Pending;
                }
                let deadline = me
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(sleep(me.write_timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        me.write_deadline = None;
                        Poll::Ready(Err(ErrorKind::TimedOut.into()))
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// SOCKS5 proxy settings for chained dials.
#[derive(Clone, Debug, Default)]
pub struct Socks5Config {
    /// Proxy address, `host:port`.
    pub address: String,

    /// Optional username for username/password auth.
    pub user: Option<String>,

    /// Optional password for username/password auth.
    pub password: Option<String>,
}

/// Dials backend connections on behalf of command machines.
#[derive(Clone, Debug)]
pub struct Dialer {
    socks5: Option<Socks5Config>,
    allowed: Option<Arc<HashSet<String>>>,
}

impl Dialer {
    /// A dialer that connects directly with no restrictions.
    pub fn direct() -> Self {
        Self {
            socks5: None,
            allowed: None,
        }
    }

    /// A dialer with optional SOCKS5 chaining and an optional
    /// `host:port` allow-list.
    pub fn new(socks5: Option<Socks5Config>, allowed: Option<HashSet<String>>) -> Self {
        Self {
            socks5,
            allowed: allowed.map(Arc::new),
        }
    }

    /// Connects to `host:port` within `dial_timeout`.
    ///
    /// The timeout covers the TCP connect and, when chaining, the
    /// whole SOCKS5 handshake.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        dial_timeout: Duration,
    ) -> io::Result<TcpStream> {
        let target = format!("{}:{}", host, port);
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&target) {
                return Err(io::Error::new(
                    ErrorKind::PermissionDenied,
                    "remote host is not allowed by the preset list",
                ));
            }
        }

        timeout(dial_timeout, self.connect(host, port, &target))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "dial timed out"))?
    }

    async fn connect(&self, host: &str, port: u16, target: &str) -> io::Result<TcpStream> {
        match &self.socks5 {
            None => {
                debug!(%target, "dialing");
                TcpStream::connect(target).await
            }
            Some(proxy) => {
                debug!(%target, proxy = %proxy.address, "dialing through socks5");
                let mut stream = TcpStream::connect(&proxy.address).await?;
                socks5_connect(&mut stream, host, port, proxy).await?;
                Ok(stream)
            }
        }
    }
}

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_METHOD_NONE: u8 = 0x00;
const SOCKS5_METHOD_USERPASS: u8 = 0x02;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_V4: u8 = 0x01;
const SOCKS5_ATYP_NAME: u8 = 0x03;
const SOCKS5_ATYP_V6: u8 = 0x04;

fn socks5_error(message: &str) -> io::Error {
    io::Error::new(ErrorKind::ConnectionRefused, format!("socks5: {}", message))
}

/// Runs the SOCKS5 CONNECT handshake on an established proxy
/// connection.
async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &Socks5Config,
) -> io::Result<()> {
    let want_auth = proxy.user.is_some() || proxy.password.is_some();
    let method = if want_auth {
        SOCKS5_METHOD_USERPASS
    } else {
        SOCKS5_METHOD_NONE
    };

    stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION || reply[1] != method {
        return Err(socks5_error("method negotiation rejected"));
    }

    if want_auth {
        let user = proxy.user.as_deref().unwrap_or("");
        let password = proxy.password.as_deref().unwrap_or("");
        if user.len() > 255 || password.len() > 255 {
            return Err(socks5_error("credentials too long"));
        }

        let mut req = vec![0x01, user.len() as u8];
        req.extend_from_slice(user.as_bytes());
        req.push(password.len() as u8);
        req.extend_from_slice(password.as_bytes());
        stream.write_all(&req).await?;

        let mut auth_reply = [0u8; 2];
        stream.read_exact(&mut auth_reply).await?;
        if auth_reply[1] != 0x00 {
            return Err(socks5_error("authentication rejected"));
        }
    }

    let mut req = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            req.push(SOCKS5_ATYP_V4);
            req.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            req.push(SOCKS5_ATYP_V6);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(socks5_error("host name too long"));
            }
            req.push(SOCKS5_ATYP_NAME);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(socks5_error("malformed reply"));
    }
    if head[1] != 0x00 {
        return Err(socks5_error("connect request refused"));
    }

    // Drain the bound address so the stream starts clean.
    let bound_len = match head[3] {
        SOCKS5_ATYP_V4 => 4,
        SOCKS5_ATYP_V6 => 16,
        SOCKS5_ATYP_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        _ => return Err(socks5_error("malformed reply")),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_budget_consume() {
        let budget = DeadlineBudget::new();
        assert!(!budget.try_consume());

        budget.settle();
        assert!(budget.try_consume());
        assert!(!budget.try_consume());

        budget.grant();
        for _ in 0..EXTENSION_LIMIT {
            assert!(budget.try_consume());
        }
        assert!(!budget.try_consume());
    }

    #[test]
    fn test_budget_disarm_never_drains() {
        let budget = DeadlineBudget::new();
        budget.disarm();
        assert!(budget.is_disarmed());
        for _ in 0..3 {
            assert!(budget.try_consume());
        }
        assert!(budget.is_disarmed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stream_read_expires() {
        let (near, _far) = tokio::io::duplex(64);
        let mut stream = TimeoutStream::new(
            near,
            Duration::from_millis(20),
            Duration::ZERO,
            DeadlineBudget::new(),
        );
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stream_disarmed_read_never_expires() {
        let (near, mut far) = tokio::io::duplex(64);
        let budget = DeadlineBudget::new();
        budget.disarm();

        let mut stream =
            TimeoutStream::new(near, Duration::from_millis(20), Duration::ZERO, budget);

        tokio::spawn(async move {
            // Far beyond the deadline that would have fired.
            sleep(Duration::from_secs(3600)).await;
            far.write_all(b"idle session data").await.unwrap();
        });

        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"idle session data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stream_budget_extends_read() {
        let (near, mut far) = tokio::io::duplex(64);
        let budget = DeadlineBudget::new();
        budget.grant();

        let mut stream =
            TimeoutStream::new(near, Duration::from_millis(20), Duration::ZERO, budget);

        tokio::spawn(async move {
            // Arrives only after the first deadline would have fired.
            sleep(Duration::from_millis(50)).await;
            far.write_all(b"late").await.unwrap();
        });

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_allow_list_refuses_unlisted_host() {
        let allowed: HashSet<String> = ["allowed.example:22".to_owned()].into();
        let dialer = Dialer::new(None, Some(allowed));
        let err = dialer
            .dial("denied.example", 22, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = Dialer::direct();
        let dial = dialer.dial("127.0.0.1", port, Duration::from_secs(5));
        let (conn, accepted) = tokio::join!(dial, listener.accept());
        conn.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connect_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            conn.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x01, 0x00, 0x03]);
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            conn.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..usize::from(len[0])], b"remote.example");
            assert_eq!(&rest[usize::from(len[0])..], &[0x00, 0x17]);

            // Reply: granted, bound to 0.0.0.0:0.
            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            conn.write_all(b"banner").await.unwrap();
        });

        let dialer = Dialer::new(
            Some(Socks5Config {
                address: proxy_addr,
                user: None,
                password: None,
            }),
            None,
        );
        let mut conn = dialer
            .dial("remote.example", 23, Duration::from_secs(5))
            .await
            .unwrap();

        let mut banner = [0u8; 6];
        conn.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"banner");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            conn.read_exact(&mut head).await.unwrap();
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            conn.read_exact(&mut rest).await.unwrap();

            // Host unreachable.
            conn.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let dialer = Dialer::new(
            Some(Socks5Config {
                address: proxy_addr,
                user: None,
                password: None,
            }),
            None,
        );
        assert!(dialer
            .dial("remote.example", 23, Duration::from_secs(5))
            .await
            .is_err());
    }
}
