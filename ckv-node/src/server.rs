//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them against the
//! node state with minimal overhead.

use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use ckv_common::{
    reply_bulk, reply_bulk_array, reply_error, reply_integer, reply_null, reply_simple, Bins,
    RespError, RespParser, Status,
};

use crate::filter;
use crate::node::NodeState;

/// Handles a single TCP client connection until EOF or node shutdown.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    state: Arc<NodeState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();

    if *shutdown.borrow() {
        return Ok(());
    }

    loop {
        let bytes = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            read = stream.read_buf(&mut buffer) => read?,
        };
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let response = dispatch_command(&args, state.as_ref());
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(RespError::Protocol) | Err(RespError::Io(_)) => {
                    stream
                        .write_all(&reply_error(Status::BadRequest, "protocol error"))
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], state: &NodeState) -> Vec<u8> {
    if args.is_empty() {
        return reply_error(Status::BadRequest, "empty command");
    }

    let cmd = &args[0];
    if cmd.eq_ignore_ascii_case(b"PING") {
        return handle_ping(args);
    }
    if cmd.eq_ignore_ascii_case(b"NODE") {
        return handle_node(state);
    }
    if cmd.eq_ignore_ascii_case(b"PEERS") {
        return handle_peers(state);
    }
    if cmd.eq_ignore_ascii_case(b"GET") {
        return handle_get(args, state);
    }
    if cmd.eq_ignore_ascii_case(b"EXISTS") {
        return handle_exists(args, state);
    }
    if cmd.eq_ignore_ascii_case(b"PUT") {
        return handle_put(args, state);
    }
    if cmd.eq_ignore_ascii_case(b"DEL") {
        return handle_del(args, state);
    }
    if cmd.eq_ignore_ascii_case(b"INFO") {
        return handle_info(state);
    }

    reply_error(Status::BadRequest, "unknown command")
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => reply_simple("PONG"),
        2 => reply_bulk(&args[1]),
        _ => reply_error(Status::BadRequest, "wrong number of arguments for PING"),
    }
}

fn handle_node(state: &NodeState) -> Vec<u8> {
    reply_bulk_array(&[state.node_id.as_bytes(), state.cluster_name.as_bytes()])
}

fn handle_peers(state: &NodeState) -> Vec<u8> {
    let peers = state.peers.read();
    let items: Vec<&[u8]> = peers.iter().map(|peer| peer.as_bytes()).collect();
    reply_bulk_array(&items)
}

/// Trailing options accepted by read commands.
#[derive(Default)]
struct ReadOptions {
    bins: Option<Vec<String>>,
    filter: Option<Value>,
}

fn parse_read_options(args: &[Vec<u8>]) -> Result<ReadOptions, Vec<u8>> {
    let mut options = ReadOptions::default();
    let mut idx = 0;
    while idx < args.len() {
        let name = &args[idx];
        let value = args
            .get(idx + 1)
            .ok_or_else(|| reply_error(Status::BadRequest, "option without value"))?;
        if name.eq_ignore_ascii_case(b"BINS") {
            let bins: Vec<String> = serde_json::from_slice(value)
                .map_err(|_| reply_error(Status::BadRequest, "invalid bin list"))?;
            options.bins = Some(bins);
        } else if name.eq_ignore_ascii_case(b"FILTER") {
            let expr: Value = serde_json::from_slice(value)
                .map_err(|_| reply_error(Status::BadRequest, "invalid filter expression"))?;
            options.filter = Some(expr);
        } else if name.eq_ignore_ascii_case(b"CL") {
            // Single-copy store: ONE and ALL read the same data.
            if !value.eq_ignore_ascii_case(b"ONE") && !value.eq_ignore_ascii_case(b"ALL") {
                return Err(reply_error(Status::BadRequest, "invalid consistency level"));
            }
        } else {
            return Err(reply_error(Status::BadRequest, "unknown option"));
        }
        idx += 2;
    }
    Ok(options)
}

fn check_filter(filter: Option<&Value>, bins: &Bins) -> Result<(), Vec<u8>> {
    let Some(expr) = filter else {
        return Ok(());
    };
    match filter::evaluate(expr, bins) {
        Ok(true) => Ok(()),
        Ok(false) => Err(reply_error(Status::FilteredOut, "filtered out")),
        Err(message) => Err(reply_error(Status::BadRequest, &message)),
    }
}

fn handle_get(args: &[Vec<u8>], state: &NodeState) -> Vec<u8> {
    if args.len() < 2 {
        return reply_error(Status::BadRequest, "wrong number of arguments for GET");
    }
    let options = match parse_read_options(&args[2..]) {
        Ok(options) => options,
        Err(resp) => return resp,
    };

    let Some(record) = state.store.get(&args[1]) else {
        return reply_null();
    };
    if let Err(resp) = check_filter(options.filter.as_ref(), &record.bins) {
        return resp;
    }

    let record = match &options.bins {
        Some(names) => record.project(names),
        None => record,
    };
    match record.to_json() {
        Ok(payload) => reply_bulk(&payload),
        Err(_) => reply_error(Status::ServerFailure, "encode error"),
    }
}

fn handle_exists(args: &[Vec<u8>], state: &NodeState) -> Vec<u8> {
    if args.len() < 2 {
        return reply_error(Status::BadRequest, "wrong number of arguments for EXISTS");
    }
    let options = match parse_read_options(&args[2..]) {
        Ok(options) => options,
        Err(resp) => return resp,
    };

    let Some(record) = state.store.get(&args[1]) else {
        return reply_null();
    };
    if let Err(resp) = check_filter(options.filter.as_ref(), &record.bins) {
        return resp;
    }

    match record.meta().to_json() {
        Ok(payload) => reply_bulk(&payload),
        Err(_) => reply_error(Status::ServerFailure, "encode error"),
    }
}

/// Trailing options accepted by write commands.
#[derive(Default)]
struct WriteOptions {
    ttl: u32,
    filter: Option<Value>,
}

fn parse_write_options(args: &[Vec<u8>], allow_ttl: bool) -> Result<WriteOptions, Vec<u8>> {
    let mut options = WriteOptions::default();
    for pair in args.chunks(2) {
        let [name, value] = pair else {
            return Err(reply_error(Status::BadRequest, "option without value"));
        };
        if allow_ttl && name.eq_ignore_ascii_case(b"TTL") {
            options.ttl = parse_u32(value)?;
        } else if name.eq_ignore_ascii_case(b"FILTER") {
            let expr: Value = serde_json::from_slice(value)
                .map_err(|_| reply_error(Status::BadRequest, "invalid filter expression"))?;
            options.filter = Some(expr);
        } else {
            return Err(reply_error(Status::BadRequest, "unknown option"));
        }
    }
    Ok(options)
}

/// Write guard: the filter must accept the stored record, if any.
fn write_filter(filter: Option<&Value>) -> impl FnOnce(&Bins) -> Result<(), Vec<u8>> + '_ {
    move |bins| check_filter(filter, bins)
}

fn handle_put(args: &[Vec<u8>], state: &NodeState) -> Vec<u8> {
    if args.len() < 3 {
        return reply_error(Status::BadRequest, "wrong number of arguments for PUT");
    }

    let bins: Bins = match serde_json::from_slice(&args[2]) {
        Ok(bins) => bins,
        Err(_) => return reply_error(Status::BadRequest, "invalid bins"),
    };
    let options = match parse_write_options(&args[3..], true) {
        Ok(options) => options,
        Err(resp) => return resp,
    };
    match state.store.put_if(&args[1], bins, options.ttl, write_filter(options.filter.as_ref())) {
        Ok(generation) => reply_integer(generation as i64),
        Err(resp) => resp,
    }
}

fn handle_del(args: &[Vec<u8>], state: &NodeState) -> Vec<u8> {
    if args.len() < 2 {
        return reply_error(Status::BadRequest, "wrong number of arguments for DEL");
    }
    let options = match parse_write_options(&args[2..], false) {
        Ok(options) => options,
        Err(resp) => return resp,
    };
    match state.store.delete_if(&args[1], write_filter(options.filter.as_ref())) {
        Ok(removed) => reply_integer(removed as i64),
        Err(resp) => resp,
    }
}

fn handle_info(state: &NodeState) -> Vec<u8> {
    let info = format!(
        "node_id:{}\r\ncluster_name:{}\r\nrecords:{}\r\n",
        state.node_id,
        state.cluster_name,
        state.store.len()
    );
    reply_bulk(info.as_bytes())
}

fn parse_u32(arg: &[u8]) -> Result<u32, Vec<u8>> {
    if arg.is_empty() {
        return Err(reply_error(Status::BadRequest, "invalid integer"));
    }
    let mut value: u32 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(reply_error(Status::BadRequest, "invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u32);
    }
    Ok(value)
}
