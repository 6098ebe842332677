//! Bind-address resolution and display origins.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use super::ServerInfo;

/// Where the listener will bind, plus how to present it.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) addr: SocketAddr,
    /// Hostname shown in the local origin.
    pub(crate) display_host: String,
    /// Whether the bind accepts traffic on every interface.
    pub(crate) wildcard: bool,
}

/// Resolve `host` into a bind address.
///
/// `accept_any_ip` forces a wildcard bind. A hostname that fails to
/// resolve falls back to loopback rather than failing startup.
pub(crate) async fn resolve(host: &str, port: u16, accept_any_ip: bool) -> Binding {
    if accept_any_ip {
        return Binding {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            display_host: "localhost".into(),
            wildcard: true,
        };
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Binding {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            display_host: "localhost".into(),
            wildcard: false,
        };
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Binding {
            addr: SocketAddr::new(ip, port),
            display_host: host.into(),
            wildcard: ip.is_unspecified(),
        };
    }

    let lookup = (host.to_string(), port);
    let resolved = async_global_executor::spawn_blocking(move || {
        lookup
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
    })
    .await;
    match resolved {
        Ok(addrs) if !addrs.is_empty() => {
            let addr = addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
            Binding {
                addr,
                display_host: host.into(),
                wildcard: false,
            }
        }
        _ => {
            log::warn!("could not resolve {}, falling back to loopback", host);
            Binding {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                display_host: "localhost".into(),
                wildcard: false,
            }
        }
    }
}

/// A canonical origin: default ports dropped, IPv6 hosts bracketed.
pub(crate) fn origin(secure: bool, host: &str, port: u16) -> String {
    let scheme = if secure { "https" } else { "http" };
    let default_port = if secure { 443 } else { 80 };
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == default_port {
        format!("{}://{}", scheme, host)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}

/// The address this machine uses to reach the local network.
///
/// The connect call only selects a route; no packet is sent.
fn lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(("10.254.254.254", 1)).ok()?;
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_loopback())
}

/// Build the listening info once the listener reports its real
/// address. `addr` carries the resolved port for ephemeral binds.
pub(crate) fn server_info(
    binding: &Binding,
    addr: SocketAddr,
    secure: bool,
    external_origin: Option<String>,
) -> ServerInfo {
    let port = addr.port();
    let local_host = if binding.wildcard {
        "localhost"
    } else {
        binding.display_host.as_str()
    };
    let internal_origin = if binding.wildcard {
        lan_ip().map(|ip| origin(secure, &ip.to_string(), port))
    } else {
        None
    };
    ServerInfo {
        addr,
        local_origin: origin(secure, local_host, port),
        internal_origin,
        external_origin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    #[test]
    fn default_ports_are_stripped() {
        assert_eq!(origin(false, "localhost", 80), "http://localhost");
        assert_eq!(origin(true, "localhost", 443), "https://localhost");
        assert_eq!(origin(false, "localhost", 8080), "http://localhost:8080");
        assert_eq!(origin(true, "example.com", 80), "https://example.com:80");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(origin(false, "::1", 3000), "http://[::1]:3000");
        assert_eq!(origin(false, "[::1]", 3000), "http://[::1]:3000");
    }

    #[test]
    fn localhost_skips_resolution() {
        let binding = block_on(resolve("localhost", 8080, false));
        assert_eq!(
            binding.addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
        );
        assert!(!binding.wildcard);
    }

    #[test]
    fn literal_ips_classify() {
        let loopback = block_on(resolve("127.0.0.1", 80, false));
        assert!(!loopback.wildcard);
        assert_eq!(loopback.display_host, "127.0.0.1");

        let wildcard = block_on(resolve("0.0.0.0", 80, false));
        assert!(wildcard.wildcard);

        let forced = block_on(resolve("192.168.1.5", 80, true));
        assert!(forced.wildcard);
        assert_eq!(
            forced.addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80)
        );
    }

    #[test]
    fn unresolvable_hosts_fall_back_to_loopback() {
        let binding = block_on(resolve("does-not-exist.invalid", 4000, false));
        assert_eq!(
            binding.addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
        );
    }

    #[test]
    fn wildcard_info_prefers_localhost_display() {
        let binding = Binding {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            display_host: "localhost".into(),
            wildcard: true,
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000);
        let info = server_info(&binding, addr, false, Some("https://demo.example".into()));
        assert_eq!(info.local_origin, "http://localhost:3000");
        assert_eq!(info.external_origin.as_deref(), Some("https://demo.example"));
    }
}
