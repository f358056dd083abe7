//! TCP accept loop and per-connection read/write tasks. Listener setup goes
//! through `socket2` so `SO_REUSEADDR` and an explicit backlog can be
//! applied before the socket is handed to Tokio.

use crate::channel::ChannelHandle;
use crate::codec::{Frame, OutboundFrame, RegistryCodec};
use crate::error::{is_connection_fatal, RegistryResult};
use crate::model::Acknowledge;
use crate::server::RegistryServer;
use futures::StreamExt;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Bind a `TcpListener` with `SO_REUSEADDR` set and an explicit backlog,
/// rather than relying on whatever default `TcpListener::bind` picks.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> RegistryResult<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept connections until the listener errors. Each accepted socket gets
/// its own read/write task pair sharing a `ChannelHandle`.
pub async fn run_accept_loop(listener: TcpListener, server: Arc<RegistryServer>) {
    loop {
        match listener.accept().await {
            Ok((socket, remote_addr)) => {
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::warn!(%remote_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let server = server.clone();
                tokio::spawn(async move {
                    handle_connection(socket, remote_addr, server).await;
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed, stopping accept loop");
                return;
            }
        }
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, remote_addr: SocketAddr, server: Arc<RegistryServer>) {
    let (egress_tx, mut egress_rx) = mpsc::channel::<OutboundFrame>(256);
    let channel = ChannelHandle::new(remote_addr, egress_tx);
    let framed = Framed::new(socket, RegistryCodec::new());
    let (mut sink, mut stream) = framed.split();

    server.on_connect(&channel);

    let write_task = {
        let server = server.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            use futures::SinkExt;
            while let Some(frame) = egress_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
                server.on_write_complete(&channel);
            }
        })
    };

    loop {
        tokio::select! {
            biased;
            _ = channel.closed() => {
                tracing::debug!(%remote_addr, "connection closed by idle timeout or shutdown");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(Frame::Heartbeat)) => {
                    server.on_read(&channel);
                }
                Some(Ok(Frame::Message(message))) => {
                    server.on_read(&channel);
                    // Ack the inbound sequence before processing, so the
                    // client can release its own pending-ack entry without
                    // waiting on fan-out effects.
                    let ack = Acknowledge { sequence: message.sequence };
                    if let Ok(frame) = OutboundFrame::for_ack(&ack) {
                        let _ = channel.try_send(frame);
                    }
                    if let Err(err) = server.dispatch_inbound(&channel, message).await {
                        tracing::warn!(%remote_addr, error = %err, "failed to handle inbound message");
                        if is_connection_fatal(&err) {
                            break;
                        }
                    }
                }
                Some(Ok(Frame::Ack(ack))) => {
                    server.on_read(&channel);
                    server.handle_acknowledge(&channel, ack);
                }
                Some(Err(err)) => {
                    tracing::warn!(%remote_addr, error = %err, "decode error, closing connection");
                    break;
                }
                None => break,
            },
        }
    }

    channel.mark_inactive();
    server.on_disconnect(&channel);
    write_task.abort();
}
