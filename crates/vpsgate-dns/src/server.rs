use crate::resolve::Resolver;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

/// Authoritative DNS front-end for the managed zone, UDP and TCP.
pub struct DnsServer {
    listen_addr: SocketAddr,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub fn new(listen_addr: SocketAddr, resolver: Arc<Resolver>) -> Self {
        Self {
            listen_addr,
            resolver,
        }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        let tcp_listener = TcpListener::bind(self.listen_addr).await?;
        info!("DNS server listening on {} (UDP+TCP)", self.listen_addr);

        let mut buf = vec![0u8; 4096];
        let mut shutdown_udp = shutdown.clone();
        let mut shutdown_tcp = shutdown;

        let resolver_tcp = self.resolver.clone();

        // TCP accept loop
        let tcp_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = tcp_listener.accept() => {
                        match result {
                            Ok((stream, src)) => {
                                debug!("TCP connection from {src}");
                                let resolver = resolver_tcp.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_tcp_connection(stream, &resolver).await {
                                        warn!("TCP handler error from {src}: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                error!("TCP accept error: {e}");
                            }
                        }
                    }
                    _ = shutdown_tcp.changed() => {
                        if *shutdown_tcp.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // UDP recv loop; each query is handled independently.
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    let data = buf[..len].to_vec();
                    let resolver = self.resolver.clone();
                    let socket = socket.clone();

                    tokio::spawn(async move {
                        match handle_query(&resolver, &data).await {
                            Ok(resp) => {
                                if let Err(e) = socket.send_to(&resp, src).await {
                                    error!("failed to send response to {src}: {e}");
                                }
                            }
                            Err(e) => {
                                warn!("failed to handle query from {src}: {e}");
                            }
                        }
                    });
                }
                _ = shutdown_udp.changed() => {
                    if *shutdown_udp.borrow() {
                        info!("DNS server shutting down");
                        break;
                    }
                }
            }
        }

        tcp_handle.abort();
        Ok(())
    }
}

async fn handle_query(resolver: &Resolver, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let request = Message::from_bytes(data)?;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(false);
    response.set_authoritative(true);

    if request.op_code() != OpCode::Query {
        response.set_response_code(ResponseCode::NotImp);
        return Ok(response.to_bytes()?);
    }

    let queries = request.queries();
    if queries.is_empty() {
        response.set_response_code(ResponseCode::FormErr);
        return Ok(response.to_bytes()?);
    }

    for query in queries {
        response.add_query(query.clone());
    }

    let query = &queries[0];
    let qname = query.name().to_string();
    let qtype = query.query_type();
    debug!("query: {qname} {qtype}");

    match resolver.answer(&qname, qtype).await {
        Some(resolved) => {
            for record in resolved.answers {
                response.add_answer(record);
            }
            for record in resolved.additionals {
                response.add_additional(record);
            }
            response.set_response_code(ResponseCode::NoError);
        }
        None => {
            response.set_response_code(ResponseCode::NXDomain);
        }
    }

    Ok(response.to_bytes()?)
}

async fn handle_tcp_connection(
    mut stream: tokio::net::TcpStream,
    resolver: &Resolver,
) -> anyhow::Result<()> {
    // 2-byte length prefix framing
    let msg_len = stream.read_u16().await? as usize;
    if msg_len == 0 {
        return Ok(());
    }

    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;

    let response = handle_query(resolver, &buf).await?;
    let len = response.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&response).await?;
    stream.flush().await?;

    Ok(())
}
