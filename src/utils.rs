use num::{One, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    io::{self},
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
};
use tracing::{debug, warn};

/// Bind a non-blocking UDP socket that can share its port with other processes
///
/// Used for the beacon listener, which competes with the repeater (and other
/// clients on the same host) for the beacon port.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address to bind"))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bind a non-blocking, broadcast-capable UDP socket on an ephemeral port
pub(crate) fn new_broadcast_udp_socket() -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    Ok(socket.into())
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::one());
    id
}

/// IPv4 broadcast addresses of every non-loopback interface
pub fn interface_broadcast_addresses(port: u16) -> Vec<SocketAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .flat_map(|i| i.ips.into_iter())
        .filter(|i| i.is_ipv4())
        .flat_map(|f| (f.broadcast(), port).to_socket_addrs())
        .flatten()
        .collect()
}

/// Resolve a whitespace-separated address list, applying a default port
///
/// Hostnames are resolved, so calling this again will re-resolve.
pub fn parse_address_list(addr_list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in addr_list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                let addr: Vec<_> = addr.filter(|a| a.is_ipv4()).collect();
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr);
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
                continue;
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut i), u32::MAX);
        assert_eq!(i, 0);
    }

    #[test]
    fn address_list_applies_default_port() {
        let addresses = parse_address_list("127.0.0.1 127.0.0.2:6000  ", 5064);
        assert_eq!(
            addresses,
            vec![
                "127.0.0.1:5064".parse().unwrap(),
                "127.0.0.2:6000".parse().unwrap()
            ]
        );
    }
}
