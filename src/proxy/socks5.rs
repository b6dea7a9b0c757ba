//! SOCKS5 handler
//!
//! No-auth CONNECT only; the reply is sent after the upstream dial so a
//! failed dial can be reported with the proper reply code.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::ProxyServer;
use crate::common::{relay, Stream};
use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

pub(crate) async fn handle(proxy: &ProxyServer, mut stream: Stream) -> Result<()> {
    // 1. Greeting: version and offered auth methods
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::Protocol("no acceptable auth method".to_string()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // 2. Request: command and target address
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(
            "invalid SOCKS version in request".to_string(),
        ));
    }

    let cmd = header[1];
    let atyp = header[3];

    let target = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(&mut stream).await?;
            format!("{}:{}", Ipv4Addr::from(addr), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(&mut stream).await?;
            format!("{}:{}", String::from_utf8_lossy(&domain), port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(&mut stream).await?;
            format!("[{}]:{}", Ipv6Addr::from(addr), port)
        }
        _ => {
            write_reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                atyp
            )));
        }
    };

    if cmd != CMD_CONNECT {
        write_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!("unsupported command: {}", cmd)));
    }

    // 3. Dial, then reply
    let upstream = match proxy.dial("tcp", &target).await {
        Ok(upstream) => upstream,
        Err(_) => {
            write_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };

    write_reply(&mut stream, REP_SUCCESS).await?;

    relay(stream, upstream).await;
    Ok(())
}

async fn read_port(stream: &mut Stream) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Reply with a zeroed IPv4 bind address; clients only look at the code.
async fn write_reply(stream: &mut Stream, code: u8) -> Result<()> {
    let reply = [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
