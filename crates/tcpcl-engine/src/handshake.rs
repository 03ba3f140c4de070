//! Contact header exchange.
//!
//! Both sides send their header first and then read the peer's, so the
//! exchange cannot deadlock regardless of who connected.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use tcpcl_core::wire::{
    negotiate_keepalive, ContactHeader, TCPCL_MAGIC, EID_HOSTNAME_MAX, MAX_EID_LEN,
};
use tcpcl_core::WireError;

use crate::error::TcpclError;
use crate::io::{read_sdnv, receive_required, Link, Sent};

/// Result of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub peer: ContactHeader,
    /// min(local, peer) keepalive seconds. Zero disables keepalives.
    pub keepalive: u16,
}

/// Encode and write the local contact header.
pub async fn send_contact_header<W: AsyncWrite + Unpin>(
    link: &mut Link<W>,
    local: &ContactHeader,
) -> Result<Sent, TcpclError> {
    let mut buf = BytesMut::new();
    local.encode(&mut buf)?;
    link.send_bytes(&buf).await
}

/// Read and validate the peer's contact header.
///
/// Stops at the first field that fails validation; nothing after it is read.
pub async fn receive_contact_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    local_keepalive: u16,
) -> Result<Negotiated, TcpclError> {
    let mut magic = [0u8; TCPCL_MAGIC.len()];
    receive_required(reader, &mut magic, "contact header").await?;
    ContactHeader::check_magic(&magic)?;

    let mut params = [0u8; 4];
    receive_required(reader, &mut params, "contact header").await?;
    let (version, flags, keepalive) = ContactHeader::parse_parameters(params)?;

    let eid_len = read_sdnv(reader, "contact header").await?;
    if eid_len > MAX_EID_LEN {
        return Err(WireError::EidTooLong(eid_len).into());
    }
    let mut eid = vec![0u8; eid_len as usize];
    receive_required(reader, &mut eid, "contact header").await?;

    let peer = ContactHeader {
        version,
        flags,
        keepalive,
        local_eid: String::from_utf8_lossy(&eid).into_owned(),
    };
    Ok(Negotiated {
        keepalive: negotiate_keepalive(local_keepalive, peer.keepalive),
        peer,
    })
}

/// Send ours, then read theirs.
pub async fn exchange_contact_headers<R, W>(
    reader: &mut R,
    link: &mut Link<W>,
    local: &ContactHeader,
) -> Result<Negotiated, TcpclError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match send_contact_header(link, local).await? {
        Sent::Complete(_) => {}
        Sent::Lost => return Err(TcpclError::ConnectionLost),
    }
    receive_contact_header(reader, local.keepalive).await
}

/// `dtn://<hostname>.dtn`, hostname cut to 60 characters.
pub fn local_eid_from_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    let host = if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        tracing::warn!(error = %std::io::Error::last_os_error(), "gethostname failed");
        "localhost".to_string()
    };
    let host: String = host.chars().take(EID_HOSTNAME_MAX).collect();
    format!("dtn://{host}.dtn")
}

/// The configured EID, or one derived from the hostname when empty.
pub fn resolve_local_eid(configured: &str) -> String {
    if configured.is_empty() {
        local_eid_from_hostname()
    } else {
        configured.to_string()
    }
}
