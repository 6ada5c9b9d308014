//! Process-wide visitor session.
//!
//! `SessionResolver` is the only writer of the session. It moves through
//! `Unresolved -> Anonymous | Authenticated(role unknown) -> Authenticated(role known)`
//! and every observer reads it through a subscription. Each transition bumps a
//! generation counter; asynchronous work started for generation N is dropped if the
//! session has moved on by the time it completes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::{
    sync::{OnceCell, broadcast, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    auth::AuthState,
    error::AuthError,
    models::{Identity, Role, SessionView},
};

/// RoleState
///
/// The role half of an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Identity is known, the role fetch has not completed yet.
    Unknown,
    /// `None` when the profile carries no role.
    Resolved(Option<Role>),
    /// The role fetch failed; treated as having no role.
    Failed,
}

/// Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Session {
    #[default]
    Unresolved,
    Anonymous,
    Authenticated { user_id: Uuid, role: RoleState },
}

impl Session {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Session::Unresolved)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated { .. })
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Session::Authenticated { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Session::Authenticated {
                role: RoleState::Resolved(role),
                ..
            } => *role,
            _ => None,
        }
    }

    /// True only for a known `Admin` or `SuperAdmin` role.
    pub fn is_admin(&self) -> bool {
        self.role().is_some_and(Role::is_admin)
    }

    /// Whether the resolver still has work to do for this state.
    fn needs_resolution(&self) -> bool {
        matches!(
            self,
            Session::Unresolved
                | Session::Authenticated {
                    role: RoleState::Unknown,
                    ..
                }
        )
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            authenticated: self.is_authenticated(),
            user_id: self.user_id(),
            role: self.role(),
            is_admin: self.is_admin(),
        }
    }
}

/// AuthEvent
///
/// Sign-in/sign-out notifications pushed by the auth provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
}

/// SessionProvider
///
/// The external auth collaborator. `on_change` hands out a receiver; dropping it
/// unsubscribes.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_current_identity(&self) -> Result<Option<Identity>, AuthError>;

    fn on_change(&self) -> broadcast::Receiver<AuthEvent>;

    async fn get_role(&self, user_id: Uuid) -> Result<Option<Role>, AuthError>;
}

/// SupabaseSessionProvider
///
/// `SessionProvider` for a client holding one hosted-backend access token at a time.
pub struct SupabaseSessionProvider {
    auth: AuthState,
    token: RwLock<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

impl SupabaseSessionProvider {
    pub fn new(auth: AuthState) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            auth,
            token: RwLock::new(None),
            events,
        }
    }

    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Adopts a freshly issued access token and announces the sign-in.
    pub fn sign_in(&self, access_token: String) -> Result<Identity, AuthError> {
        let identity = self.auth.verify_token(&access_token)?;
        self.set_token(Some(access_token));
        // No subscribers is not an error.
        let _ = self.events.send(AuthEvent::SignedIn(identity));
        Ok(identity)
    }

    pub fn sign_out(&self) {
        self.set_token(None);
        let _ = self.events.send(AuthEvent::SignedOut);
    }
}

#[async_trait]
impl SessionProvider for SupabaseSessionProvider {
    async fn get_current_identity(&self) -> Result<Option<Identity>, AuthError> {
        match self.token() {
            Some(token) => self.auth.verify_token(&token).map(Some),
            None => Ok(None),
        }
    }

    fn on_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn get_role(&self, user_id: Uuid) -> Result<Option<Role>, AuthError> {
        let token = self
            .token()
            .ok_or_else(|| AuthError::RoleLookup("no access token".to_string()))?;
        self.auth.fetch_role(Identity { user_id }, &token).await
    }
}

type SharedResolution = Arc<OnceCell<Result<Session, AuthError>>>;

struct ResolverInner {
    generation: u64,
    pending: Option<(u64, SharedResolution)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SessionSubscription
///
/// A registered observer of the session. Dropping it (or calling `unsubscribe`)
/// removes the registration.
pub struct SessionSubscription {
    rx: watch::Receiver<Session>,
}

impl SessionSubscription {
    pub fn current(&self) -> Session {
        *self.rx.borrow()
    }

    /// Waits for the next transition. `None` once the resolver is gone.
    pub async fn changed(&mut self) -> Option<Session> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn unsubscribe(self) {}
}

/// SessionResolver
///
/// Owns the session state machine. Resolution is single-flight per generation: any
/// number of concurrent `resolve` calls share one identity fetch and one role fetch.
pub struct SessionResolver {
    provider: Arc<dyn SessionProvider>,
    inner: Mutex<ResolverInner>,
    state: watch::Sender<Session>,
}

impl SessionResolver {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        let (state, _) = watch::channel(Session::Unresolved);
        Self {
            provider,
            inner: Mutex::new(ResolverInner {
                generation: 0,
                pending: None,
            }),
            state,
        }
    }

    pub fn current(&self) -> Session {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            rx: self.state.subscribe(),
        }
    }

    /// resolve
    ///
    /// Drives the session to a settled state and returns it. Idempotent: a settled
    /// session is returned as is. If a transition lands while a fetch is in flight,
    /// resolution continues for the newer generation instead of returning its
    /// unsettled state.
    ///
    /// # Errors
    /// The `AuthError` of a failed identity or role fetch. The committed state is then
    /// the fail-closed one (`Anonymous`, or a `Failed` role).
    pub async fn resolve(&self) -> Result<Session, AuthError> {
        loop {
            let (generation, shared) = {
                let mut inner = lock(&self.inner);
                let current = *self.state.borrow();
                if !current.needs_resolution() {
                    return Ok(current);
                }
                let generation = inner.generation;
                let shared = match &inner.pending {
                    Some((pending_gen, cell)) if *pending_gen == generation => Arc::clone(cell),
                    _ => {
                        let cell = SharedResolution::default();
                        inner.pending = Some((generation, Arc::clone(&cell)));
                        cell
                    }
                };
                (generation, shared)
            };

            let outcome = shared.get_or_init(|| self.run(generation)).await.clone();
            if lock(&self.inner).generation == generation {
                return outcome;
            }
            tracing::debug!(generation, "session moved on during resolution, resolving again");
        }
    }

    async fn run(&self, generation: u64) -> Result<Session, AuthError> {
        let mut session = self.current();

        if session == Session::Unresolved {
            session = match self.provider.get_current_identity().await {
                Ok(Some(identity)) => Session::Authenticated {
                    user_id: identity.user_id,
                    role: RoleState::Unknown,
                },
                Ok(None) => Session::Anonymous,
                Err(e) => {
                    tracing::warn!(error = %e, "identity lookup failed, session is anonymous");
                    self.commit(generation, Session::Anonymous);
                    return Err(e);
                }
            };
            if !self.commit(generation, session) {
                return Ok(self.current());
            }
        }

        let Session::Authenticated {
            user_id,
            role: RoleState::Unknown,
        } = session
        else {
            return Ok(session);
        };

        let fetched = self.provider.get_role(user_id).await;
        let role = match &fetched {
            Ok(role) => RoleState::Resolved(*role),
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "role lookup failed, no role granted");
                RoleState::Failed
            }
        };
        let settled = Session::Authenticated { user_id, role };
        if !self.commit(generation, settled) {
            tracing::debug!(%user_id, generation, "dropping role of a superseded session");
            return Ok(self.current());
        }
        fetched.map(|_| settled)
    }

    /// Publishes `session` if no transition happened since `generation` started.
    fn commit(&self, generation: u64, session: Session) -> bool {
        let inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        tracing::info!(?session, generation, "session transition");
        self.state.send_replace(session);
        true
    }

    /// Starts a new generation with `session` as its initial state.
    fn transition(&self, session: Session) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        inner.pending = None;
        tracing::info!(?session, generation = inner.generation, "session transition");
        self.state.send_replace(session);
    }

    /// Applies the synchronous part of a provider event. A sign-out is fully applied
    /// when this returns; a sign-in leaves the role to `resolve`.
    pub fn apply_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(identity) => self.transition(Session::Authenticated {
                user_id: identity.user_id,
                role: RoleState::Unknown,
            }),
            AuthEvent::SignedOut => self.transition(Session::Anonymous),
        }
    }

    pub async fn handle_event(&self, event: AuthEvent) -> Result<Session, AuthError> {
        self.apply_event(event);
        self.resolve().await
    }

    /// Explicit sign-out acknowledged by the caller: no `Authenticated` read is possible
    /// after this returns.
    pub fn sign_out(&self) {
        self.apply_event(AuthEvent::SignedOut);
    }

    /// Forgets the current state and resolves again from the provider.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        self.transition(Session::Unresolved);
        self.resolve().await
    }

    /// attach
    ///
    /// Subscribes to the provider and keeps the session in step with it: resolves once,
    /// then applies every event as it arrives. Role fetches run on their own tasks so a
    /// sign-out is never queued behind one.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        let mut events = resolver.provider.on_change();

        tokio::spawn(async move {
            resolver.spawn_resolve();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        resolver.apply_event(event);
                        resolver.spawn_resolve();
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "missed auth events, resolving from scratch");
                        resolver.transition(Session::Unresolved);
                        resolver.spawn_resolve();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_resolve(self: &Arc<Self>) {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = resolver.resolve().await {
                tracing::warn!(error = %e, "session resolution failed");
            }
        });
    }
}
