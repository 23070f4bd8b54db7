use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};
#[cfg(unix)]
use std::os::unix::io::{FromRawFd, IntoRawFd};
#[cfg(windows)]
use std::os::windows::io::{FromRawSocket, IntoRawSocket};

use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;

pub(crate) struct Socket {
    pub(crate) socket: UdpSocket,
}

impl Socket {
    /// Open the raw ICMPv4 socket bound to `0.0.0.0`. Raw sockets need
    /// CAP_NET_RAW (or root), so this is the privilege check of the process.
    pub(crate) fn new() -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        socket.set_nonblocking(true)?;
        #[cfg(windows)]
        let socket = UdpSocket::from_std(unsafe {
            std::net::UdpSocket::from_raw_socket(socket.into_raw_socket())
        })?;
        #[cfg(unix)]
        let socket =
            UdpSocket::from_std(unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) })?;

        Ok(Self { socket })
    }

    pub(crate) async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
