//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::{error::Error, node::NodeService};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Line-framed TCP front of a storage node. Every connection carries exactly
/// one request: a `"<verb>:<args>\n"` header, an optional payload, and a
/// trailer. On failure the node writes one `"error:<message>\n"` line and
/// closes.
pub struct NodeServer {
    listener: TcpListener,
    service: Arc<NodeService>,
}

impl NodeServer {
    pub async fn bind(port: u16, service: NodeService) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;

        Ok(Self {
            listener,
            service: Arc::new(service),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires, one task per connection.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("failed to accept connection: {err}");
                            continue;
                        }
                    };

                    let service = self.service.clone();
                    let cancel = cancel.child_token();

                    tokio::spawn(async move {
                        serve_connection(service, stream, peer, cancel).await;
                    });
                }
            }
        }

        info!("tcp server stopped");
    }
}

async fn serve_connection(
    service: Arc<NodeService>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    trace!("accepted connection from {peer}");

    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    if let Err(err) = route_request(&service, &mut reader, &mut writer, &cancel).await {
        if matches!(err, Error::Cancelled) {
            debug!("operation cancelled by shutdown");
        } else {
            error!("operation was fatal: {err}");
        }

        let message = err.to_string().replace('\n', " ");
        let _ = writer.write_all(format!("error:{message}\n").as_bytes()).await;
    }

    let _ = writer.flush().await;
}

async fn route_request<R, W>(
    service: &NodeService,
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut header = String::new();
    if reader.read_line(&mut header).await.is_err() {
        return Ok(());
    }

    // a header without a verb separator is dropped without a reply
    let Some((verb, args)) = header.trim().split_once(':') else {
        return Ok(());
    };
    let args = args.trim();

    match verb {
        "save_file" => save_file(service, reader, writer, args, cancel).await,
        "get_file" => get_file(service, reader, writer, args, cancel).await,
        "delete_file" => service.delete_file(args).await,
        _ => Ok(()),
    }
}

async fn save_file<R, W>(
    service: &NodeService,
    reader: &mut R,
    writer: &mut W,
    args: &str,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (size, name) = args
        .split_once(':')
        .ok_or_else(|| Error::BadRequest(format!("invalid header: {args}")))?;
    let size: i64 = size
        .parse()
        .map_err(|err| Error::BadRequest(format!("invalid payload size: {err}")))?;

    let mut payload = reader.take(size.max(0) as u64);
    let written = service.save_file(name, &mut payload, cancel).await?;

    writer.write_all(format!("{written}\n").as_bytes()).await?;
    Ok(())
}

async fn get_file<R, W>(
    service: &NodeService,
    reader: &mut R,
    writer: &mut W,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let written = service.get_file(name, writer, cancel).await?;
    writer.flush().await?;

    // the trailer is advisory; the client enforces the size it asked for
    let mut trailer = String::new();
    reader.read_line(&mut trailer).await?;

    let received: i64 = trailer
        .trim()
        .parse()
        .map_err(|err| Error::BadRequest(format!("invalid trailer: {err}")))?;

    if written != received {
        warn!("file size not equal {written} != {received}");
    }

    Ok(())
}
