//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::error::Error;
use socket2::{SockRef, TcpKeepalive};
use std::{io, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    time::timeout,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const SEND_CHUNK_SIZE: usize = 1024 * 1024;

/// Speaker of the node wire protocol. Construction is cheap; every call
/// dials a fresh connection to the node.
#[derive(Debug)]
pub struct Client {
    addr: String,
}

impl Client {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| {
                Error::Unavailable(format!("failed to connect to node: {} timed out", self.addr))
            })?
            .map_err(|err| Error::Unavailable(format!("failed to connect to node: {err}")))?;

        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        Ok(stream)
    }

    /// Streams exactly `size` bytes from `src` to the node under `name`,
    /// then verifies the node's written-count trailer.
    pub async fn save_file<R>(&self, name: &str, src: &mut R, size: i64) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let stream = self.connect().await?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        writer
            .write_all(format!("save_file:{size}:{name}\n").as_bytes())
            .await
            .map_err(wire("failed to send header"))?;

        let mut payload = src.take(size.max(0) as u64);
        let mut chunk = vec![0u8; SEND_CHUNK_SIZE];
        let mut sent: i64 = 0;

        loop {
            let read = payload
                .read(&mut chunk)
                .await
                .map_err(wire("failed to read chunk"))?;
            if read == 0 {
                break;
            }

            writer
                .write_all(&chunk[..read])
                .await
                .map_err(wire("failed to send chunk"))?;
            sent += read as i64;
        }

        writer.flush().await.map_err(wire("failed to send buffered data"))?;

        let mut trailer = String::new();
        reader
            .read_line(&mut trailer)
            .await
            .map_err(wire("failed to receive written size"))?;

        let written: i64 = trailer.trim().parse().map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse written size from {:?}", trailer.trim()),
            ))
        })?;

        if written != sent {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "written size does not match file size",
            )));
        }

        Ok(())
    }

    /// Copies exactly `size` bytes of the named blob into `dst` and reports
    /// the received count back to the node. A short read fails the call.
    pub async fn get_file<W>(&self, name: &str, dst: &mut W, size: i64) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(format!("get_file:{name}\n").as_bytes())
            .await
            .map_err(wire("failed to send header"))?;

        let mut payload = reader.take(size.max(0) as u64);
        let received = tokio::io::copy(&mut payload, dst)
            .await
            .map_err(wire("failed to receive file data"))? as i64;

        writer
            .write_all(format!("{received}\n").as_bytes())
            .await
            .map_err(wire("failed to send received size"))?;

        if received != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file size not equal {size} != {received}"),
            )));
        }

        Ok(())
    }

    /// Requests deletion of the named blob. The protocol carries no
    /// acknowledgement for deletes; the connection is simply closed.
    pub async fn delete_file(&self, name: &str) -> Result<(), Error> {
        let mut stream = self.connect().await?;

        stream
            .write_all(format!("delete_file:{name}\n").as_bytes())
            .await
            .map_err(wire("failed to send header"))?;

        Ok(())
    }
}

fn wire(context: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |err| Error::Io(io::Error::new(err.kind(), format!("{context}: {err}")))
}
