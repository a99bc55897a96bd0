//! Dispatch of the SMTP `AUTH` command to pluggable mechanism handlers.
//!
//! A [`MechanismRegistry`] aggregates several [`AuthHandlerFactory`]
//! implementations (one per SASL flavour such as `PLAIN` or `LOGIN`)
//! behind a single facade. The registry is assembled once through a
//! [`MechanismRegistryBuilder`] and is immutable afterwards, so it can be
//! cloned cheaply and shared by every connection. Each connection then
//! calls [`MechanismRegistry::begin_session`] to obtain a
//! [`DispatchSession`] that routes the negotiation to the right handler.

use std::{collections::HashMap, fmt::Display, net::IpAddr, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::AuthConfig;

/// SMTP reply code used when the client asks for an unknown mechanism.
pub const MECHANISM_NOT_SUPPORTED: u16 = 504;

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// A protocol level rejection that must be relayed to the SMTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// SMTP reply code (e.g. `504`).
    pub code: u16,
    /// Human readable reason sent after the code.
    pub message: String,
}

impl Rejection {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rejection for a mechanism that is not part of the registry.
    pub fn unsupported_mechanism() -> Self {
        Self::new(MECHANISM_NOT_SUPPORTED, "Unrecognized authentication type")
    }

    /// Renders the rejection as a single SMTP reply line.
    pub fn to_reply(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Errors that can occur during authentication.
///
/// [`AuthError::Rejected`] is regular protocol traffic and should be
/// written back to the client. [`AuthError::MalformedCommand`] and
/// [`AuthError::NotBound`] signal that the caller broke the dispatcher's
/// contract and point at an integration bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The negotiation was refused with an SMTP reply code.
    Rejected(Rejection),
    /// The first line handed to the dispatcher was not `AUTH <mechanism>`.
    MalformedCommand(String),
    /// The identity was requested before any mechanism was bound.
    NotBound,
    /// The mechanism handler encountered an internal error.
    EngineError(String),
}

impl AuthError {
    /// Returns the rejection to relay to the client, if this is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            AuthError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Whether the error comes from a misuse of the dispatcher API.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, AuthError::MalformedCommand(_) | AuthError::NotBound)
    }
}

impl Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Rejected(rejection) => write!(f, "Rejected: {rejection}"),
            AuthError::MalformedCommand(command) => write!(f, "Not an AUTH command: {command}"),
            AuthError::NotBound => write!(f, "No authentication mechanism is active"),
            AuthError::EngineError(msg) => write!(f, "Engine error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<Rejection> for AuthError {
    fn from(rejection: Rejection) -> Self {
        AuthError::Rejected(rejection)
    }
}

/// The identity established by a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a single negotiation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// More data is needed, the payload goes into a `334` reply.
    Challenge(String),
    /// The negotiation completed and the identity is available.
    Done,
}

impl AuthStep {
    pub fn is_done(&self) -> bool {
        matches!(self, AuthStep::Done)
    }
}

/// Connection details made available to mechanism handlers.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// IP address of the connecting SMTP client.
    pub client_ip: Option<IpAddr>,

    /// HELO/EHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,

    /// Whether the channel is protected by TLS.
    pub secure: bool,
}

/// A stateful handler driving one mechanism for one connection.
pub trait AuthHandler: Send {
    /// Processes one client line.
    ///
    /// The first invocation receives the complete `AUTH <mechanism> ...`
    /// command line, later invocations receive raw continuation lines.
    fn auth(&mut self, line: &str, context: &SessionContext) -> AuthResult<AuthStep>;

    /// Returns the authenticated identity once [`AuthStep::Done`] was reported.
    fn identity(&self) -> Option<&Identity>;
}

/// Produces fresh [`AuthHandler`] instances for the mechanisms it advertises.
pub trait AuthHandlerFactory: Send + Sync {
    /// Names of the mechanisms served by this factory, in preference order.
    fn mechanisms(&self) -> Vec<String>;

    /// Creates a handler for a new negotiation.
    fn create(&self) -> Box<dyn AuthHandler>;
}

/// Build phase of a [`MechanismRegistry`].
#[derive(Default)]
pub struct MechanismRegistryBuilder {
    mechanisms: Vec<String>,
    factories: HashMap<String, Arc<dyn AuthHandlerFactory>>,
    allowed: Option<Vec<String>>,
}

impl MechanismRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every mechanism advertised by `factory`.
    ///
    /// Names are upper-cased. A name that is already registered keeps
    /// its original factory and position, so the union of several
    /// factories is idempotent and the first registration wins.
    pub fn register(mut self, factory: Arc<dyn AuthHandlerFactory>) -> Self {
        for mechanism in factory.mechanisms() {
            let mechanism = mechanism.to_ascii_uppercase();
            if self.factories.contains_key(&mechanism) {
                debug!(mechanism = %mechanism, "Mechanism already registered, skipping");
                continue;
            }
            self.mechanisms.push(mechanism.clone());
            self.factories.insert(mechanism, Arc::clone(&factory));
        }
        self
    }

    /// Restricts the final registry to the given mechanism names.
    pub fn allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed = Some(
            names
                .into_iter()
                .map(|name| name.as_ref().to_ascii_uppercase())
                .collect(),
        );
        self
    }

    /// Applies the `[smtp.auth]` configuration, an empty list allows everything.
    pub fn with_config(self, config: &AuthConfig) -> Self {
        if config.mechanisms.is_empty() {
            self
        } else {
            self.allow(&config.mechanisms)
        }
    }

    /// Freezes the builder into an immutable, shareable registry.
    pub fn build(self) -> MechanismRegistry {
        let Self {
            mut mechanisms,
            mut factories,
            allowed,
        } = self;

        if let Some(allowed) = allowed {
            mechanisms.retain(|mechanism| allowed.contains(mechanism));
            factories.retain(|mechanism, _| allowed.contains(mechanism));
        }

        info!(mechanisms = ?mechanisms, "Authentication mechanisms registered");
        MechanismRegistry {
            inner: Arc::new(RegistryInner {
                mechanisms,
                factories,
            }),
        }
    }
}

struct RegistryInner {
    mechanisms: Vec<String>,
    factories: HashMap<String, Arc<dyn AuthHandlerFactory>>,
}

/// Immutable set of authentication mechanisms shared by all connections.
///
/// Cloning is cheap, every clone points at the same frozen state.
#[derive(Clone)]
pub struct MechanismRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("mechanisms", &self.inner.mechanisms)
            .finish()
    }
}

impl MechanismRegistry {
    pub fn builder() -> MechanismRegistryBuilder {
        MechanismRegistryBuilder::new()
    }

    /// Builds a registry from factories, registered in iteration order.
    pub fn from_factories<I>(factories: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn AuthHandlerFactory>>,
    {
        factories
            .into_iter()
            .fold(Self::builder(), |builder, factory| builder.register(factory))
            .build()
    }

    /// Upper-cased mechanism names in registration order, as advertised
    /// to clients after `EHLO`.
    pub fn mechanisms(&self) -> &[String] {
        &self.inner.mechanisms
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mechanisms.is_empty()
    }

    /// Checks whether `name` is supported (case-insensitive).
    pub fn supports(&self, name: &str) -> bool {
        self.inner
            .factories
            .contains_key(&name.to_ascii_uppercase())
    }

    /// Renders the `AUTH` EHLO keyword, `None` when no mechanism is registered.
    pub fn ehlo_keyword(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!("AUTH {}", self.inner.mechanisms.join(" ")))
    }

    /// Starts the negotiation state for a new connection.
    pub fn begin_session(&self) -> DispatchSession {
        DispatchSession {
            registry: self.clone(),
            active: ActiveHandler::Unbound,
        }
    }

    /// Resolves the mechanism of an `AUTH` command line and creates its handler.
    fn select(&self, line: &str) -> AuthResult<ActiveHandler> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default();
        if !verb.eq_ignore_ascii_case("AUTH") {
            error!(verb = %verb, "Dispatcher received a line that is not an AUTH command");
            return Err(AuthError::MalformedCommand(verb.to_string()));
        }

        let Some(token) = tokens.next() else {
            error!("Dispatcher received an AUTH command without a mechanism");
            return Err(AuthError::MalformedCommand(verb.to_string()));
        };

        let mechanism = token.to_ascii_uppercase();
        let Some(factory) = self.inner.factories.get(&mechanism) else {
            warn!(mechanism = %mechanism, "Unsupported authentication mechanism requested");
            return Err(Rejection::unsupported_mechanism().into());
        };

        debug!(mechanism = %mechanism, "Authentication mechanism bound");
        Ok(ActiveHandler::Bound {
            handler: factory.create(),
            mechanism,
        })
    }
}

impl AuthHandlerFactory for MechanismRegistry {
    fn mechanisms(&self) -> Vec<String> {
        self.inner.mechanisms.clone()
    }

    fn create(&self) -> Box<dyn AuthHandler> {
        Box::new(self.begin_session())
    }
}

enum ActiveHandler {
    Unbound,
    Bound {
        mechanism: String,
        handler: Box<dyn AuthHandler>,
    },
}

/// Per-connection negotiation state.
///
/// Starts unbound and binds to a concrete handler on the first accepted
/// `AUTH` line. Once bound it stays bound until dropped with the connection.
pub struct DispatchSession {
    registry: MechanismRegistry,
    active: ActiveHandler,
}

impl std::fmt::Debug for DispatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSession")
            .field("mechanism", &self.mechanism())
            .finish()
    }
}

impl DispatchSession {
    /// Routes a client line to the active handler, binding one first if needed.
    ///
    /// A rejected first line leaves the session unbound, so the client may
    /// retry with another mechanism.
    pub fn handle(&mut self, line: &str, context: &SessionContext) -> AuthResult<AuthStep> {
        if let ActiveHandler::Unbound = self.active {
            self.active = self.registry.select(line)?;
        }
        match &mut self.active {
            ActiveHandler::Bound { handler, .. } => handler.auth(line, context),
            ActiveHandler::Unbound => Err(AuthError::NotBound),
        }
    }

    /// Identity reported by the bound handler.
    ///
    /// Asking before any handler was bound is a caller error and yields
    /// [`AuthError::NotBound`]. A bound handler that has not completed
    /// yet returns `Ok(None)`.
    pub fn identity(&self) -> AuthResult<Option<&Identity>> {
        match &self.active {
            ActiveHandler::Bound { handler, .. } => Ok(handler.identity()),
            ActiveHandler::Unbound => {
                error!("Identity requested before any authentication mechanism was bound");
                Err(AuthError::NotBound)
            }
        }
    }

    /// Name of the bound mechanism, if any.
    pub fn mechanism(&self) -> Option<&str> {
        match &self.active {
            ActiveHandler::Bound { mechanism, .. } => Some(mechanism),
            ActiveHandler::Unbound => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.active, ActiveHandler::Bound { .. })
    }

    pub fn registry(&self) -> &MechanismRegistry {
        &self.registry
    }
}

impl AuthHandler for DispatchSession {
    fn auth(&mut self, line: &str, context: &SessionContext) -> AuthResult<AuthStep> {
        self.handle(line, context)
    }

    /// An unbound session reports `None` here, the `NotBound` contract
    /// violation is only logged. Callers that must tell "unbound" apart
    /// from "not finished" should use [`DispatchSession::identity`].
    fn identity(&self) -> Option<&Identity> {
        DispatchSession::identity(self).ok().flatten()
    }
}
