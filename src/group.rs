use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use mio::{Poll, Token, Waker};
use tracing::warn;

use crate::config::{GroupConfig, MessageHandler};
use crate::error::BotError;
use crate::net::connection::{ConnState, StateCell};
use crate::net::future::LoginFuture;
use crate::net::game::{MessageDecoder, MessageEncoder};
use crate::net::login::{encode_base37, LoginEncoder};
use crate::net::message::GameMessage;
use crate::net::reactor::{Command, EventLoop, Registration, WAKER_TOKEN};
use crate::net::rsa::RsaPublicKey;

// Errors crossing the IO thread boundary are routed here instead of
// unwinding the reactor.
pub trait ExceptionHandler: Send + Sync {
    fn on_bot_error(&self, username: &str, error: &BotError);
    fn on_group_error(&self, error: &BotError);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogExceptionHandler;

impl ExceptionHandler for LogExceptionHandler {
    fn on_bot_error(&self, username: &str, error: &BotError) {
        warn!(username, %error, "bot error");
    }

    fn on_group_error(&self, error: &BotError) {
        warn!(%error, "bot group error");
    }
}

pub(crate) struct GroupInner {
    connect_address: SocketAddr,
    rsa_key: Option<RsaPublicKey>,
    pub(crate) login_encoder: Arc<dyn LoginEncoder>,
    pub(crate) message_encoder: Arc<dyn MessageEncoder>,
    pub(crate) message_decoder: Arc<dyn MessageDecoder>,
    pub(crate) exception_handler: Arc<dyn ExceptionHandler>,
    pub(crate) message_handler: Arc<MessageHandler>,
    bots: RwLock<HashMap<String, Bot>>,
    commands: Sender<Command>,
    waker: Waker,
    next_token: AtomicUsize,
    terminated: AtomicBool,
    io_thread: Mutex<IoThread>,
}

struct IoThread {
    poll: Option<Poll>,
    receiver: Option<Receiver<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl GroupInner {
    pub(crate) fn remove_bot_entry(&self, username: &str) {
        self.bots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(username);
    }

    fn logout_entry(&self, username: &str) -> Result<Bot, BotError> {
        let bot = self
            .bots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(username)
            .ok_or_else(|| BotError::UnknownBot {
                username: username.to_string(),
            })?;
        let _ = self.commands.send(Command::Close(bot.inner.token));
        let _ = self.waker.wake();
        Ok(bot)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

// A single simulated player. Handles are cheap to clone and compare
// equal when their usernames hash to the same base-37 value.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

struct BotInner {
    username: String,
    username_hash: u64,
    token: Token,
    state: Arc<StateCell>,
    future: LoginFuture,
    outbound: Sender<GameMessage>,
    group: Weak<GroupInner>,
}

impl Bot {
    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn username_hash(&self) -> u64 {
        self.inner.username_hash
    }

    pub fn state(&self) -> ConnState {
        self.inner.state.load()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == ConnState::LoggedIn
    }

    pub fn login_future(&self) -> LoginFuture {
        self.inner.future.clone()
    }

    // Game messages are queued for the IO thread and the selector is
    // woken. Writes before login completes (or after the connection
    // died) are silent no-ops.
    pub fn write(&self, msg: GameMessage) {
        if self.state() != ConnState::LoggedIn {
            return;
        }
        let Some(group) = self.inner.group.upgrade() else {
            return;
        };
        if self.inner.outbound.send(msg).is_ok() {
            let _ = group.commands.send(Command::Flush(self.inner.token));
            let _ = group.waker.wake();
        }
    }

    pub fn logout(&self) -> Result<(), BotError> {
        let group = self.inner.group.upgrade().ok_or(BotError::LoopTerminated)?;
        group.logout_entry(&self.inner.username)?;
        Ok(())
    }
}

impl PartialEq for Bot {
    fn eq(&self, other: &Self) -> bool {
        self.inner.username_hash == other.inner.username_hash
    }
}

impl Eq for Bot {}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("username", &self.inner.username)
            .field("state", &self.state())
            .finish()
    }
}

// A group of bots sharing one connect address, one codec configuration
// and one IO thread. The thread starts lazily with the first login.
pub struct BotGroup {
    inner: Arc<GroupInner>,
}

impl BotGroup {
    pub fn new(config: GroupConfig) -> Result<Self, BotError> {
        if let Some(key) = &config.rsa_key {
            if !key.is_usable() {
                return Err(BotError::Configuration("rsa modulus is trivial".into()));
            }
        }
        let poll = Poll::new()
            .map_err(|err| BotError::Configuration(format!("selector setup failed: {err}")))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|err| BotError::Configuration(format!("selector setup failed: {err}")))?;
        let (commands, receiver) = crossbeam_channel::unbounded();

        Ok(Self {
            inner: Arc::new(GroupInner {
                connect_address: config.connect_address,
                rsa_key: config.rsa_key,
                login_encoder: config.login_encoder,
                message_encoder: config.message_encoder,
                message_decoder: config.message_decoder,
                exception_handler: config.exception_handler,
                message_handler: config.message_handler,
                bots: RwLock::new(HashMap::new()),
                commands,
                waker,
                next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
                terminated: AtomicBool::new(false),
                io_thread: Mutex::new(IoThread {
                    poll: Some(poll),
                    receiver: Some(receiver),
                    handle: None,
                }),
            }),
        })
    }

    // Registers a new bot and starts its asynchronous connect and
    // login. The returned future resolves when the handshake finishes.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginFuture, BotError> {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::SeqCst) {
            return Err(BotError::LoopTerminated);
        }

        let token = Token(inner.next_token.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(StateCell::new(ConnState::Registered));
        let future = LoginFuture::new(Arc::clone(&state));
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let bot = Bot {
            inner: Arc::new(BotInner {
                username: username.to_string(),
                username_hash: encode_base37(username),
                token,
                state: Arc::clone(&state),
                future: future.clone(),
                outbound: outbound_tx,
                group: Arc::downgrade(inner),
            }),
        };

        {
            let mut bots = inner.bots.write().unwrap_or_else(PoisonError::into_inner);
            if bots.contains_key(username) {
                return Err(BotError::DuplicateBot {
                    username: username.to_string(),
                });
            }
            bots.insert(username.to_string(), bot);
        }

        if let Err(err) = self.start_bot(username, password, token, state, &future, outbound_rx) {
            inner.remove_bot_entry(username);
            return Err(err);
        }
        Ok(future)
    }

    fn start_bot(
        &self,
        username: &str,
        password: &str,
        token: Token,
        state: Arc<StateCell>,
        future: &LoginFuture,
        outbound: Receiver<GameMessage>,
    ) -> Result<(), BotError> {
        self.ensure_loop_started()?;

        let stream = mio::net::TcpStream::connect(self.inner.connect_address)?;
        stream.set_nodelay(true)?;

        let registration = Registration {
            stream,
            token,
            username: username.to_string(),
            password: password.to_string(),
            rsa_key: self.inner.rsa_key.clone(),
            state,
            future: future.clone(),
            outbound,
        };
        self.inner
            .commands
            .send(Command::Register(Box::new(registration)))
            .map_err(|_| BotError::LoopTerminated)?;
        self.inner.waker.wake()?;
        Ok(())
    }

    fn ensure_loop_started(&self) -> Result<(), BotError> {
        let mut io_thread = self
            .inner
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if io_thread.handle.is_some() {
            return Ok(());
        }
        let (poll, receiver) = match (io_thread.poll.take(), io_thread.receiver.take()) {
            (Some(poll), Some(receiver)) => (poll, receiver),
            _ => return Err(BotError::LoopTerminated),
        };
        let event_loop = EventLoop::new(poll, receiver, Arc::downgrade(&self.inner));
        let handle = std::thread::Builder::new()
            .name("rsbot-io".into())
            .spawn(move || event_loop.run())?;
        io_thread.handle = Some(handle);
        Ok(())
    }

    // Closes the bot's socket; the rest of the group is untouched.
    pub fn logout(&self, username: &str) -> Result<Bot, BotError> {
        self.inner.logout_entry(username)
    }

    pub fn logout_all(&self) {
        let usernames: Vec<String> = {
            let bots = self.inner.bots.read().unwrap_or_else(PoisonError::into_inner);
            bots.keys().cloned().collect()
        };
        for username in usernames {
            let _ = self.logout(&username);
        }
    }

    // Logs out every bot and stops the IO thread. The group cannot be
    // reused afterwards.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
        let _ = self.inner.waker.wake();
        let handle = self
            .inner
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.mark_terminated();
    }

    pub fn get(&self, username: &str) -> Option<Bot> {
        self.inner
            .bots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.inner
            .bots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    pub fn bots(&self) -> Vec<Bot> {
        self.inner
            .bots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .bots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn connect_address(&self) -> SocketAddr {
        self.inner.connect_address
    }
}

impl Drop for BotGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BotGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotGroup")
            .field("connect_address", &self.inner.connect_address)
            .field("bots", &self.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
