//! Socket diagnostics client (`NETLINK_SOCK_DIAG`).
//!
//! One dump request per query, scoped to IPv4 TCP sockets in ESTABLISHED state whose
//! destination port is the target port, with the `tcp_info` extension so byte counters
//! come back with each socket.
//!
//! The wire codec is plain byte manipulation and works everywhere; only the socket I/O
//! in [`SockDiag`] is Linux specific.

use std::net::{IpAddr, Ipv4Addr};

use tracing::trace;

use crate::error::DiagError;

const NLMSG_HDR_LEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_DUMP: u16 = 0x300;
const SOCK_DIAG_BY_FAMILY: u16 = 20;

const AF_INET: u8 = 2;
const IPPROTO_TCP: u8 = 6;
const TCP_ESTABLISHED: u8 = 1;
const INET_DIAG_INFO: u16 = 2;
const INET_DIAG_NOCOOKIE: u32 = !0;

// struct inet_diag_msg
const DIAG_MSG_LEN: usize = 72;
const SPORT_OFF: usize = 4;
const DPORT_OFF: usize = 6;
const DST_OFF: usize = 24;

// struct tcp_info
const TCPI_BYTES_ACKED_OFF: usize = 120;
const TCPI_BYTES_RECEIVED_OFF: usize = 128;

/// One established connection as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub source_port: u16,
    pub destination: IpAddr,
    pub bytes_acked: u64,
    pub bytes_received: u64,
}

/// Anything that can list established connections to a port.
pub trait ConnectionSource: Send + Sync {
    fn query(&self, port: u16) -> Result<Vec<ConnectionRecord>, DiagError>;
}

/// Kernel-backed source using a fresh netlink socket per query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SockDiag;

impl ConnectionSource for SockDiag {
    #[cfg(target_os = "linux")]
    fn query(&self, port: u16) -> Result<Vec<ConnectionRecord>, DiagError> {
        let records = sys::dump(&encode_request(port, 1), port)?;
        trace!(port, count = records.len(), "sock_diag dump");
        Ok(records)
    }

    #[cfg(not(target_os = "linux"))]
    fn query(&self, _port: u16) -> Result<Vec<ConnectionRecord>, DiagError> {
        Err(DiagError::Unsupported)
    }
}

/// Build an `nlmsghdr` + `inet_diag_req_v2` dump request.
pub fn encode_request(port: u16, seq: u32) -> Vec<u8> {
    let total = NLMSG_HDR_LEN + 56;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    buf.push(AF_INET);
    buf.push(IPPROTO_TCP);
    buf.push(1 << (INET_DIAG_INFO - 1));
    buf.push(0);
    buf.extend_from_slice(&(1u32 << TCP_ESTABLISHED).to_ne_bytes());

    // inet_diag_sockid: ports are big endian, addresses and interface left empty
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&[0u8; 32]);
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());
    buf.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());
    debug_assert_eq!(buf.len(), total);
    buf
}

/// Decode one receive buffer of netlink messages, appending matching records to `out`.
///
/// Returns `Ok(true)` once the `NLMSG_DONE` terminator has been seen.
pub fn decode_messages(
    buf: &[u8],
    port: u16,
    out: &mut Vec<ConnectionRecord>,
) -> Result<bool, DiagError> {
    let mut off = 0;
    while off + NLMSG_HDR_LEN <= buf.len() {
        let len = read_u32(buf, off) as usize;
        if len < NLMSG_HDR_LEN || off + len > buf.len() {
            return Err(DiagError::Truncated { offset: off });
        }
        let kind = read_u16(buf, off + 4);
        let payload = &buf[off + NLMSG_HDR_LEN..off + len];
        match kind {
            NLMSG_DONE => return Ok(true),
            NLMSG_ERROR => {
                if payload.len() < 4 {
                    return Err(DiagError::Truncated { offset: off });
                }
                let errno = read_u32(payload, 0) as i32;
                if errno != 0 {
                    return Err(DiagError::Netlink { errno: -errno });
                }
            }
            SOCK_DIAG_BY_FAMILY => {
                if let Some(record) = decode_socket(payload, off)? {
                    if port == 0 || record_port(payload) == port {
                        out.push(record);
                    }
                }
            }
            _ => {}
        }
        off += align4(len);
    }
    Ok(false)
}

fn decode_socket(msg: &[u8], at: usize) -> Result<Option<ConnectionRecord>, DiagError> {
    if msg.len() < DIAG_MSG_LEN {
        return Err(DiagError::Truncated { offset: at });
    }
    if msg[0] != AF_INET || msg[1] != TCP_ESTABLISHED {
        return Ok(None);
    }
    let source_port = u16::from_be_bytes([msg[SPORT_OFF], msg[SPORT_OFF + 1]]);
    let dst = &msg[DST_OFF..DST_OFF + 4];
    let destination = IpAddr::V4(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]));

    let mut record = ConnectionRecord {
        source_port,
        destination,
        bytes_acked: 0,
        bytes_received: 0,
    };

    let mut off = DIAG_MSG_LEN;
    while off + 4 <= msg.len() {
        let rta_len = read_u16(msg, off) as usize;
        let rta_type = read_u16(msg, off + 2);
        if rta_len < 4 || off + rta_len > msg.len() {
            break;
        }
        let data = &msg[off + 4..off + rta_len];
        if rta_type == INET_DIAG_INFO && data.len() >= TCPI_BYTES_RECEIVED_OFF + 8 {
            record.bytes_acked = read_u64(data, TCPI_BYTES_ACKED_OFF);
            record.bytes_received = read_u64(data, TCPI_BYTES_RECEIVED_OFF);
        }
        off += align4(rta_len);
    }
    Ok(Some(record))
}

fn record_port(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[DPORT_OFF], msg[DPORT_OFF + 1]])
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::{decode_messages, ConnectionRecord};
    use crate::error::DiagError;

    const RECV_BUF_LEN: usize = 64 * 1024;

    pub(super) fn dump(request: &[u8], port: u16) -> Result<Vec<ConnectionRecord>, DiagError> {
        // SAFETY: plain socket(2) call; ownership of the descriptor moves into OwnedFd.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `raw` was just returned by socket(2), is valid, and is owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid kernel destination.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `request` and `addr` outlive the call and the lengths passed match their sizes.
        let sent = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                request.as_ptr().cast(),
                request.len(),
                0,
                (&addr as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut out = Vec::new();
        loop {
            // SAFETY: `buf` is a live, writable allocation of exactly `buf.len()` bytes.
            let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Err(DiagError::Truncated { offset: 0 });
            }
            if decode_messages(&buf[..n as usize], port, &mut out)? {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlmsg(kind: u16, payload: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDR_LEN + payload.len();
        let mut m = Vec::new();
        m.extend_from_slice(&(len as u32).to_ne_bytes());
        m.extend_from_slice(&kind.to_ne_bytes());
        m.extend_from_slice(&0u16.to_ne_bytes());
        m.extend_from_slice(&0u32.to_ne_bytes());
        m.extend_from_slice(&0u32.to_ne_bytes());
        m.extend_from_slice(payload);
        while m.len() % 4 != 0 {
            m.push(0);
        }
        m
    }

    fn socket_msg(sport: u16, dport: u16, dst: [u8; 4], acked: u64, received: u64) -> Vec<u8> {
        let mut p = vec![0u8; DIAG_MSG_LEN];
        p[0] = AF_INET;
        p[1] = TCP_ESTABLISHED;
        p[SPORT_OFF..SPORT_OFF + 2].copy_from_slice(&sport.to_be_bytes());
        p[DPORT_OFF..DPORT_OFF + 2].copy_from_slice(&dport.to_be_bytes());
        p[DST_OFF..DST_OFF + 4].copy_from_slice(&dst);

        let mut info = vec![0u8; 232];
        info[TCPI_BYTES_ACKED_OFF..TCPI_BYTES_ACKED_OFF + 8].copy_from_slice(&acked.to_ne_bytes());
        info[TCPI_BYTES_RECEIVED_OFF..TCPI_BYTES_RECEIVED_OFF + 8]
            .copy_from_slice(&received.to_ne_bytes());
        p.extend_from_slice(&((info.len() + 4) as u16).to_ne_bytes());
        p.extend_from_slice(&INET_DIAG_INFO.to_ne_bytes());
        p.extend_from_slice(&info);
        nlmsg(SOCK_DIAG_BY_FAMILY, &p)
    }

    #[test]
    fn request_layout() {
        let req = encode_request(22, 7);
        assert_eq!(req.len(), 72);
        assert_eq!(read_u32(&req, 0), 72);
        assert_eq!(read_u16(&req, 4), SOCK_DIAG_BY_FAMILY);
        assert_eq!(read_u16(&req, 6), NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(read_u32(&req, 8), 7);
        assert_eq!(req[16], AF_INET);
        assert_eq!(req[17], IPPROTO_TCP);
        assert_eq!(req[18], 0b10);
        assert_eq!(read_u32(&req, 20), 1 << TCP_ESTABLISHED);
        assert_eq!(&req[26..28], &22u16.to_be_bytes());
    }

    #[test]
    fn decodes_records_until_done() {
        let mut buf = socket_msg(40000, 22, [10, 0, 0, 1], 1_000, 50);
        buf.extend(socket_msg(40001, 22, [10, 0, 0, 2], 2_000, 60));
        buf.extend(nlmsg(NLMSG_DONE, &0u32.to_ne_bytes()));
        let mut out = Vec::new();
        assert!(decode_messages(&buf, 22, &mut out).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_port, 40000);
        assert_eq!(out[0].destination, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(out[0].bytes_acked, 1_000);
        assert_eq!(out[1].bytes_received, 60);
    }

    #[test]
    fn filters_other_ports_and_reports_partial() {
        let buf = socket_msg(40000, 443, [10, 0, 0, 1], 1, 1);
        let mut out = Vec::new();
        assert!(!decode_messages(&buf, 22, &mut out).unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn netlink_error_propagates() {
        let buf = nlmsg(NLMSG_ERROR, &(-13i32).to_ne_bytes());
        let err = decode_messages(&buf, 22, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, DiagError::Netlink { errno: 13 }));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut buf = socket_msg(1, 22, [1, 2, 3, 4], 0, 0);
        buf.truncate(40);
        assert!(matches!(
            decode_messages(&buf, 22, &mut Vec::new()),
            Err(DiagError::Truncated { .. })
        ));
    }
}
