//! # Per-node Connection Pool
//!
//! Blocking TCP connections reused by worker threads.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the pool limit returns `NoMoreConnections`
//!    immediately instead of waiting.
//! 4. **Cache-Friendly Buffers**: Each connection reuses its own buffers.

use std::collections::VecDeque;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ckv_common::{encode_command, read_response, RespError, RespValue, Status};

use crate::error::{Error, Result};

/// Pool limits for one node.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) addr: SocketAddr,
    /// Maximum number of idle connections to keep.
    pub(crate) max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub(crate) max_total: usize,
    pub(crate) connect_timeout: Duration,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Acquires a connection, opening a new one when none is idle.
    pub(crate) fn acquire(&self) -> Result<PooledConnection> {
        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        if !self.try_reserve() {
            return Err(Error::new(
                Status::NoMoreConnections,
                "no more connections available",
            ));
        }

        let config = &self.inner.config;
        match Connection::connect(config.addr, config.connect_timeout) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Drops every idle connection.
    pub(crate) fn clear(&self) {
        let mut state = self.inner.state.lock();
        let dropped = state.idle.len();
        state.idle.clear();
        state.total = state.total.saturating_sub(dropped);
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.inner.state.lock().idle.pop_front()
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub(crate) struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::new(Status::ClientFailure, "connection already released"))
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let result = self.conn()?.set_timeout(timeout);
        if result.is_err() {
            self.valid = false;
        }
        result
    }

    /// Executes one command.
    pub(crate) fn exec(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        let response = self.conn()?.exec(args);
        if response.is_err() {
            // A broken stream must not go back to the pool.
            self.valid = false;
        }
        response
    }

    /// Writes every command before reading the replies in order.
    pub(crate) fn exec_pipeline(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<RespValue>> {
        let response = self.conn()?.exec_pipeline(commands);
        if response.is_err() {
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid {
            pool.return_connection(conn);
        } else {
            pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
pub(crate) struct Connection {
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    pub(crate) fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|err| connect_error(&err))?;
        stream.set_nodelay(true).map_err(|err| connect_error(&err))?;

        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };
        conn.set_timeout(Some(timeout))?;
        Ok(conn)
    }

    /// Applies the same deadline to reads and writes.
    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        // A zero duration is rejected by the socket API.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        let stream = self.reader.get_ref();
        stream.set_read_timeout(timeout).map_err(|err| io_error(&err))?;
        stream.set_write_timeout(timeout).map_err(|err| io_error(&err))?;
        Ok(())
    }

    pub(crate) fn exec(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.flush_write_buf()?;
        read_response(&mut self.reader, &mut self.line_buf).map_err(resp_error)
    }

    fn exec_pipeline(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<RespValue>> {
        self.write_buf.clear();
        for command in commands {
            let args: Vec<&[u8]> = command.iter().map(Vec::as_slice).collect();
            encode_command(&args, &mut self.write_buf);
        }
        self.flush_write_buf()?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_response(&mut self.reader, &mut self.line_buf).map_err(resp_error)?);
        }
        Ok(replies)
    }

    fn flush_write_buf(&mut self) -> Result<()> {
        let stream = self.reader.get_mut();
        stream
            .write_all(&self.write_buf)
            .and_then(|_| stream.flush())
            .map_err(|err| io_error(&err))
    }
}

fn io_error(err: &io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::new(Status::Timeout, "command timed out")
        }
        _ => Error::new(Status::NoResponse, format!("socket error: {}", err)),
    }
}

fn connect_error(err: &io::Error) -> Error {
    Error::new(Status::Connection, format!("socket error: {}", err))
}

fn resp_error(err: RespError) -> Error {
    match err {
        RespError::Io(err) => io_error(&err),
        RespError::Protocol => Error::new(Status::ClientFailure, "malformed reply from node"),
    }
}
