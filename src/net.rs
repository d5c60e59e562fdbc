use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::BindConfig;
use crate::error::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::ffi::CString;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::fd::AsRawFd;

/// Configure `SO_BINDTODEVICE` for a socket when an interface is provided.
///
/// On Linux/Android this uses `setsockopt` to constrain the socket to the
/// supplied interface. Other platforms return an error.
pub fn bind_to_device(socket: &Socket, interface: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let c_iface = CString::new(interface.as_bytes()).map_err(|_| {
            Error::Media(format!(
                "interface name contains interior NUL bytes: {interface}"
            ))
        })?;
        // Safety: the CString outlives the call and the length includes the NUL.
        let result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                c_iface.as_ptr() as *const libc::c_void,
                c_iface.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if result != 0 {
            let io_err = std::io::Error::last_os_error();
            return Err(Error::Media(format!(
                "failed to bind relay socket to interface {interface}: {io_err}"
            )));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        Err(Error::Media(format!(
            "interface binding not supported on this platform ({interface})"
        )))
    }
}

/// Bind a non-blocking UDP socket for a relay stream on `port`.
pub fn bind_relay_socket(bind: &BindConfig, port: u16) -> Result<tokio::net::UdpSocket> {
    let addr = bind.socket_addr(port);
    let domain = Domain::for_address(SocketAddr::new(bind.address, 0));
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Some(iface) = &bind.interface {
        bind_to_device(&socket, iface)?;
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(std_socket)?)
}
