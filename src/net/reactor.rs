use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, TryRecvError};
use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, info};

use crate::error::BotError;
use crate::group::GroupInner;
use crate::net::connection::{BotConnection, ConnState, StateCell};
use crate::net::future::LoginFuture;
use crate::net::message::GameMessage;
use crate::net::rsa::RsaPublicKey;

pub(crate) const WAKER_TOKEN: Token = Token(0);

pub(crate) enum Command {
    Register(Box<Registration>),
    Flush(Token),
    Close(Token),
    Shutdown,
}

pub(crate) struct Registration {
    pub stream: mio::net::TcpStream,
    pub token: Token,
    pub username: String,
    pub password: String,
    pub rsa_key: Option<RsaPublicKey>,
    pub state: Arc<StateCell>,
    pub future: LoginFuture,
    pub outbound: Receiver<GameMessage>,
}

enum Flow {
    Continue,
    Stop,
}

// Single-threaded reactor driving every connection in a group. All
// socket reads and writes, codec work and state transitions happen on
// this thread; the only blocking point is the poll call.
pub(crate) struct EventLoop {
    poll: Poll,
    commands: Receiver<Command>,
    group: Weak<GroupInner>,
    connections: HashMap<Token, BotConnection>,
}

impl EventLoop {
    pub(crate) fn new(poll: Poll, commands: Receiver<Command>, group: Weak<GroupInner>) -> Self {
        Self {
            poll,
            commands,
            group,
            connections: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        debug!("bot io thread started");

        let failure = loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Some(BotError::from(err)),
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event);
            }

            match self.drain_commands() {
                Flow::Continue => {}
                Flow::Stop => break None,
            }
        };

        if let Some(err) = failure {
            if let Some(group) = self.group.upgrade() {
                group.exception_handler.on_group_error(&err);
            }
        }
        self.shutdown();
    }

    fn dispatch(&mut self, event: &Event) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&event.token()) else {
            return;
        };

        if let Err(err) = handle_event(&group, registry, conn, event) {
            let username = conn.username().to_string();
            group.exception_handler.on_bot_error(&username, &err);
            self.close_connection(event.token(), &group);
        }
    }

    fn drain_commands(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Register(registration)) => self.register(*registration),
                Ok(Command::Flush(token)) => {
                    let registry = self.poll.registry();
                    if let Some(conn) = self.connections.get_mut(&token) {
                        if conn.state() == ConnState::LoggedIn {
                            let _ = registry.reregister(
                                &mut conn.stream,
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            );
                        }
                    }
                }
                Ok(Command::Close(token)) => {
                    if let Some(group) = self.group.upgrade() {
                        self.close_connection(token, &group);
                    }
                }
                Ok(Command::Shutdown) => return Flow::Stop,
                Err(TryRecvError::Empty) => return Flow::Continue,
                // Every group handle is gone; nobody can reach us.
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            stream,
            token,
            username,
            password,
            rsa_key,
            state,
            future,
            outbound,
        } = registration;
        let mut conn = BotConnection::new(
            stream, token, username, password, rsa_key, state, future, outbound,
        );
        match self
            .poll
            .registry()
            .register(&mut conn.stream, token, Interest::WRITABLE)
        {
            Ok(()) => {
                debug!(username = conn.username(), "bot connection registered");
                self.connections.insert(token, conn);
            }
            Err(err) => {
                conn.close();
                if let Some(group) = self.group.upgrade() {
                    group
                        .exception_handler
                        .on_bot_error(conn.username(), &err.into());
                    group.remove_bot_entry(conn.username());
                }
            }
        }
    }

    fn close_connection(&mut self, token: Token, group: &GroupInner) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            group.remove_bot_entry(conn.username());
            conn.close();
            debug!(username = conn.username(), "bot connection closed");
        }
    }

    fn shutdown(&mut self) {
        let group = self.group.upgrade();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                if let Some(group) = &group {
                    group.remove_bot_entry(conn.username());
                }
                conn.close();
            }
        }
        if let Some(group) = &group {
            group.mark_terminated();
        }
        info!("bot io thread stopped");
    }
}

fn handle_event(
    group: &GroupInner,
    registry: &Registry,
    conn: &mut BotConnection,
    event: &Event,
) -> Result<(), BotError> {
    if event.is_writable() {
        match conn.state() {
            ConnState::Registered => {
                if let Some(err) = conn.stream.take_error()? {
                    return Err(err.into());
                }
                match conn.stream.peer_addr() {
                    Ok(_) => {
                        conn.set_state(ConnState::InitialRequest);
                        group.login_encoder.encode(conn)?;
                        registry.reregister(&mut conn.stream, conn.token, Interest::READABLE)?;
                    }
                    // Spurious wakeup, the connect has not settled yet.
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                    Err(err) => return Err(err.into()),
                }
            }
            ConnState::LoggedIn => {
                while let Ok(msg) = conn.outbound.try_recv() {
                    group.message_encoder.encode(conn, msg)?;
                }
                registry.reregister(&mut conn.stream, conn.token, Interest::READABLE)?;
            }
            _ => {}
        }
    }

    if event.is_readable() {
        conn.fill_read_buf()?;

        // One handshake step per pass; stop once a step makes no
        // progress, it is waiting for more bytes.
        loop {
            let state = conn.state();
            if !state.is_login_stage() {
                break;
            }
            let buffered = conn.read_buf().remaining();
            group.login_encoder.encode(conn)?;
            if conn.state() == state && conn.read_buf().remaining() == buffered {
                break;
            }
        }

        if conn.state() == ConnState::LoggedIn && conn.read_buf().remaining() > 0 {
            let mut decoded = Vec::new();
            group.message_decoder.decode(conn, &mut decoded)?;
            for msg in decoded {
                (group.message_handler)(conn.username(), msg);
            }
        }

        if conn.read_buf().hit_eof() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )
            .into());
        }
    }

    Ok(())
}
