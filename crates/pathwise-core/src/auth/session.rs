//! Session lifecycle for the signed-in user.
//!
//! `SessionManager` owns the credential slot, the in-memory principal, and
//! the bearer handed to outbound requests. Every session transition (verify,
//! login, register, logout) takes a generation ticket when it starts; a
//! result is applied only if no transition holding a newer ticket has been
//! applied in the meantime, so a late answer can never overwrite a more
//! recent login or logout. Profile reads only refresh the principal of the
//! credential they were made with and stay out of that ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{AuthBackend, AuthError, AuthGrant, TokenStore, Verification};
use crate::api::ApiError;
use crate::models::{PasswordChange, Principal, ProfileUpdate, RegistrationForm};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_FAILED: &str = "Login failed";
const REGISTRATION_FAILED: &str = "Registration failed";
const PROFILE_FETCH_FAILED: &str = "Failed to load profile";
const PROFILE_UPDATE_FAILED: &str = "Failed to update profile";
const PASSWORD_UPDATE_FAILED: &str = "Failed to update password";
const ACCOUNT_DELETE_FAILED: &str = "Failed to delete account";

// ============================================================================
// Public State Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Verifying,
    Authenticated,
    Unauthenticated,
}

impl Phase {
    /// Protected content must not be shown while this is true.
    pub fn is_loading(&self) -> bool {
        matches!(self, Phase::Initializing | Phase::Verifying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Verifying => "verifying",
            Phase::Authenticated => "authenticated",
            Phase::Unauthenticated => "unauthenticated",
        }
    }
}

/// Point-in-time view of the session for consumers. The credential itself
/// is deliberately absent; use `SessionManager::bearer` to attach it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub principal: Option<Principal>,
    pub has_credential: bool,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.phase.is_loading()
    }
}

// ============================================================================
// Internal State
// ============================================================================

struct SessionState {
    credential: Option<String>,
    principal: Option<Principal>,
    phase: Phase,
    /// Last generation handed out
    issued: u64,
    /// Generation of the newest operation whose result was applied
    applied: u64,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            principal: self.principal.clone(),
            has_credential: self.credential.is_some(),
        }
    }

    fn issue(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn sign_out(&mut self) {
        self.credential = None;
        self.principal = None;
        self.phase = Phase::Unauthenticated;
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// One per running client. Share it as `Arc<SessionManager>`.
pub struct SessionManager {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn TokenStore>,
    state: Mutex<SessionState>,
    store_lock: Mutex<()>,
    initialized: AtomicBool,
    updates: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    /// Create the session, reading any persisted credential right away.
    /// Call `initialize` once afterwards to verify it.
    pub fn new(backend: Arc<dyn AuthBackend>, store: Arc<dyn TokenStore>) -> Self {
        let credential = match store.load() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        };
        debug!(has_credential = credential.is_some(), "Session created");

        let state = SessionState {
            credential,
            principal: None,
            phase: Phase::Initializing,
            issued: 0,
            applied: 0,
        };
        let (updates, _) = watch::channel(state.snapshot());

        Self {
            backend,
            store,
            state: Mutex::new(state),
            store_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            updates,
        }
    }

    // ===== Lifecycle =====

    /// Verify the persisted credential, once per session. Later calls return
    /// immediately. Any doubt about the credential ends in a logout.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return;
        }

        let mut stored = None;
        let generation = self.apply_now(|state| {
            if state.phase != Phase::Initializing {
                // A login or logout already settled the session
                return false;
            }
            match state.credential.clone() {
                Some(token) => {
                    state.phase = Phase::Verifying;
                    stored = Some(token);
                }
                None => state.sign_out(),
            }
            true
        });

        let (Some(generation), Some(token)) = (generation, stored) else {
            debug!("No stored credential to verify");
            return;
        };

        debug!("Verifying stored credential");
        match self.backend.verify_token(&token).await {
            Ok(Verification::Valid(principal)) => {
                let username = principal.username.clone();
                let applied = self.commit(generation, |state| {
                    state.principal = Some(principal);
                    state.phase = Phase::Authenticated;
                    true
                });
                if applied {
                    info!(user = %username, "Restored session");
                } else {
                    debug!("Discarding stale token verification");
                }
            }
            Ok(Verification::Invalid) => {
                info!("Stored credential is no longer valid");
                self.sign_out_if_current(generation);
            }
            Err(e) => {
                warn!(error = %e, "Token verification failed");
                self.sign_out_if_current(generation);
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::validation("Username and password are required"));
        }

        let generation = self.issue();
        let grant = self
            .backend
            .login(username, password)
            .await
            .map_err(|e| {
                warn!(error = %e, "Login failed");
                AuthError::from_api(&e, LOGIN_FAILED)
            })?;

        self.adopt(generation, grant)?;
        info!(user = %username, "Logged in");
        Ok(())
    }

    pub async fn register(&self, form: &RegistrationForm) -> Result<(), AuthError> {
        form.validate()?;

        let generation = self.issue();
        let grant = self.backend.register(form).await.map_err(|e| {
            warn!(error = %e, "Registration failed");
            AuthError::from_api(&e, REGISTRATION_FAILED)
        })?;

        self.adopt(generation, grant)?;
        info!(user = %form.username.trim(), "Registered");
        Ok(())
    }

    /// Forget the credential everywhere. Always succeeds.
    pub fn logout(&self) {
        self.apply_now(|state| {
            state.sign_out();
            true
        });
        self.sync_store();
        info!("Logged out");
    }

    /// Log out if `token` is still the active credential. Used when a
    /// request made with it came back unauthorized; returns whether the
    /// session was signed out.
    pub fn invalidate(&self, token: &str) -> bool {
        let signed_out = self
            .apply_now(|state| {
                if state.credential.as_deref() != Some(token) {
                    return false;
                }
                state.sign_out();
                true
            })
            .is_some();
        if signed_out {
            self.sync_store();
            info!("Credential rejected by backend, signed out");
        }
        signed_out
    }

    // ===== Account Operations =====

    /// Re-fetch the principal from the profile endpoint.
    pub async fn refresh_principal(&self) -> Result<Principal, AuthError> {
        let token = self.active_credential()?;
        let principal = self
            .backend
            .fetch_profile(&token)
            .await
            .map_err(|e| self.account_error(&token, e, PROFILE_FETCH_FAILED, true))?;
        self.replace_principal(&token, principal.clone())?;
        Ok(principal)
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Principal, AuthError> {
        update.validate()?;
        let token = self.active_credential()?;
        let principal = self
            .backend
            .update_profile(&token, update)
            .await
            .map_err(|e| self.account_error(&token, e, PROFILE_UPDATE_FAILED, true))?;
        self.replace_principal(&token, principal.clone())?;
        info!("Profile updated");
        Ok(principal)
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), AuthError> {
        change.validate()?;
        let token = self.active_credential()?;
        // A 401 here means the old password was wrong, not that the token died
        self.backend
            .change_password(&token, change)
            .await
            .map_err(|e| self.account_error(&token, e, PASSWORD_UPDATE_FAILED, false))?;
        info!("Password changed");
        Ok(())
    }

    /// Delete the account on the backend, then sign out.
    pub async fn delete_account(&self) -> Result<(), AuthError> {
        let token = self.active_credential()?;
        self.backend
            .delete_account(&token)
            .await
            .map_err(|e| self.account_error(&token, e, ACCOUNT_DELETE_FAILED, true))?;
        info!("Account deleted");
        self.invalidate(&token);
        Ok(())
    }

    // ===== Observation =====

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn principal(&self) -> Option<Principal> {
        self.lock().principal.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().principal.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().phase.is_loading()
    }

    /// The bearer token to attach to the next request. Only handed out once
    /// the credential has been verified or freshly issued.
    pub fn bearer(&self) -> Option<String> {
        let state = self.lock();
        match state.phase {
            Phase::Authenticated => state.credential.clone(),
            _ => None,
        }
    }

    /// Value for the `Authorization` header, if any.
    pub fn authorization_header(&self) -> Option<String> {
        self.bearer().map(|token| format!("Bearer {}", token))
    }

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    /// Wait until loading has finished. Never returns if `initialize` is
    /// never called and nothing else settles the session.
    pub async fn wait_until_ready(&self) -> SessionSnapshot {
        let mut updates = self.updates.subscribe();
        let ready = updates.wait_for(|s| !s.is_loading()).await;
        match ready {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    // ===== Internals =====

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self) -> u64 {
        self.lock().issue()
    }

    fn publish(&self, snapshot: SessionSnapshot) {
        self.updates.send_replace(snapshot);
    }

    /// Apply `change` under `generation` unless a newer generation has
    /// already been applied. `change` returns false to decline, in which
    /// case it must not have modified the state.
    fn commit<F>(&self, generation: u64, change: F) -> bool
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        let snapshot = {
            let mut state = self.lock();
            if generation < state.applied || !change(&mut state) {
                return false;
            }
            state.applied = generation;
            state.snapshot()
        };
        self.publish(snapshot);
        true
    }

    /// Issue a fresh generation and apply `change` under it atomically.
    fn apply_now<F>(&self, change: F) -> Option<u64>
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        let (generation, snapshot) = {
            let mut state = self.lock();
            if !change(&mut state) {
                return None;
            }
            let generation = state.issue();
            state.applied = generation;
            (generation, state.snapshot())
        };
        self.publish(snapshot);
        Some(generation)
    }

    fn adopt(&self, generation: u64, grant: AuthGrant) -> Result<(), AuthError> {
        let AuthGrant { token, principal } = grant;
        let applied = self.commit(generation, |state| {
            state.credential = Some(token);
            state.principal = Some(principal);
            state.phase = Phase::Authenticated;
            true
        });
        if applied {
            self.sync_store();
            Ok(())
        } else {
            debug!("Discarding superseded sign-in");
            Err(AuthError::superseded())
        }
    }

    /// Swap in a fresher principal for the same session. Not a session
    /// transition, so it neither takes nor advances a generation.
    fn replace_principal(&self, token: &str, principal: Principal) -> Result<(), AuthError> {
        let snapshot = {
            let mut state = self.lock();
            if state.phase != Phase::Authenticated || state.credential.as_deref() != Some(token) {
                return Err(AuthError::superseded());
            }
            state.principal = Some(principal);
            state.snapshot()
        };
        self.publish(snapshot);
        Ok(())
    }

    fn sign_out_if_current(&self, generation: u64) {
        let applied = self.commit(generation, |state| {
            state.sign_out();
            true
        });
        if applied {
            self.sync_store();
        } else {
            debug!("Session changed during verification, keeping newer state");
        }
    }

    fn active_credential(&self) -> Result<String, AuthError> {
        let state = self.lock();
        match (state.phase, &state.credential) {
            (Phase::Authenticated, Some(token)) => Ok(token.clone()),
            _ => Err(AuthError::not_authenticated()),
        }
    }

    fn account_error(
        &self,
        token: &str,
        err: ApiError,
        fallback: &str,
        unauthorized_ends_session: bool,
    ) -> AuthError {
        warn!(error = %err, "{}", fallback);
        if unauthorized_ends_session && err.is_unauthorized() {
            self.invalidate(token);
        }
        AuthError::from_api(&err, fallback)
    }

    /// Bring the persisted slot in line with the in-memory credential.
    /// Storage I/O stays outside the state lock. Writers queue on
    /// `store_lock` and each writes whatever is current when its turn comes,
    /// so the last write always matches the final state.
    fn sync_store(&self) {
        let _turn = self.store_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let credential = self.lock().credential.clone();
        let result = match credential {
            Some(token) => self.store.save(&token),
            None => self.store.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to sync stored credential");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthErrorKind, MemoryTokenStore};
    use async_trait::async_trait;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    // -------------------------------------------------------------------------
    // Scripted backend
    // -------------------------------------------------------------------------

    enum VerifyReply {
        Valid(Principal),
        Invalid,
        Unreachable,
    }

    #[derive(Default)]
    struct FakeBackend {
        verify_reply: Mutex<Option<VerifyReply>>,
        verify_gate: Mutex<Option<oneshot::Receiver<()>>>,
        login_gate: Mutex<Option<oneshot::Receiver<()>>>,
        accounts: Mutex<Vec<(String, String, AuthGrant)>>,
        profile: Mutex<Option<Principal>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeBackend {
        fn verifying(reply: VerifyReply) -> Self {
            let backend = Self::default();
            *backend.verify_reply.lock().unwrap() = Some(reply);
            backend
        }

        fn with_account(self, username: &str, password: &str, token: &str, id: i64) -> Self {
            self.accounts.lock().unwrap().push((
                username.to_string(),
                password.to_string(),
                AuthGrant {
                    token: token.to_string(),
                    principal: Principal::new(id, username),
                },
            ));
            self
        }

        fn gate_verify(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.verify_gate.lock().unwrap() = Some(rx);
            tx
        }

        fn gate_login(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.login_gate.lock().unwrap() = Some(rx);
            tx
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    async fn pass_gate(gate: &Mutex<Option<oneshot::Receiver<()>>>) {
        let rx = gate.lock().unwrap().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    #[async_trait]
    impl AuthBackend for FakeBackend {
        async fn verify_token(&self, _token: &str) -> Result<Verification, ApiError> {
            self.record("verify");
            pass_gate(&self.verify_gate).await;
            match self.verify_reply.lock().unwrap().take() {
                Some(VerifyReply::Valid(p)) => Ok(Verification::Valid(p)),
                Some(VerifyReply::Unreachable) => {
                    Err(ApiError::InvalidResponse("connection reset".to_string()))
                }
                Some(VerifyReply::Invalid) | None => Ok(Verification::Invalid),
            }
        }

        async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError> {
            self.record("login");
            pass_gate(&self.login_gate).await;
            self.accounts
                .lock()
                .unwrap()
                .iter()
                .find(|(u, p, _)| u == username && p == password)
                .map(|(_, _, grant)| grant.clone())
                .ok_or_else(|| ApiError::Unauthorized(Some("invalid credentials".to_string())))
        }

        async fn register(&self, form: &RegistrationForm) -> Result<AuthGrant, ApiError> {
            self.record("register");
            let taken = self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .any(|(u, _, _)| *u == form.username);
            if taken {
                return Err(ApiError::Rejected {
                    status: 400,
                    message: Some("Username already exists".to_string()),
                });
            }
            Ok(AuthGrant {
                token: format!("reg-{}", form.username),
                principal: Principal::new(99, form.username.clone()),
            })
        }

        async fn fetch_profile(&self, _token: &str) -> Result<Principal, ApiError> {
            self.record("fetch_profile");
            self.profile
                .lock()
                .unwrap()
                .clone()
                .ok_or(ApiError::Unauthorized(None))
        }

        async fn update_profile(
            &self,
            _token: &str,
            update: &ProfileUpdate,
        ) -> Result<Principal, ApiError> {
            self.record("update_profile");
            let mut profile = self.profile.lock().unwrap();
            let principal = profile.as_mut().ok_or(ApiError::Unauthorized(None))?;
            if let Some(minutes) = update.daily_goal_minutes {
                principal.daily_goal_minutes = Some(minutes);
            }
            Ok(principal.clone())
        }

        async fn change_password(
            &self,
            _token: &str,
            change: &PasswordChange,
        ) -> Result<(), ApiError> {
            self.record("change_password");
            if change.old_password == "Old12345" {
                Ok(())
            } else {
                Err(ApiError::Unauthorized(Some("Invalid old password".to_string())))
            }
        }

        async fn delete_account(&self, _token: &str) -> Result<(), ApiError> {
            self.record("delete_account");
            Ok(())
        }
    }

    struct BrokenStore;

    impl TokenStore for BrokenStore {
        fn load(&self) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("disk on fire"))
        }
        fn save(&self, _token: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk on fire"))
        }
        fn clear(&self) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    /// Holds every `save` until the test lets it through.
    struct SlowStore {
        saving: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
        inner: MemoryTokenStore,
    }

    impl TokenStore for SlowStore {
        fn load(&self) -> anyhow::Result<Option<String>> {
            self.inner.load()
        }
        fn save(&self, token: &str) -> anyhow::Result<()> {
            let _ = self.saving.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.save(token)
        }
        fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear()
        }
    }

    fn manager(backend: &Arc<FakeBackend>, store: &Arc<MemoryTokenStore>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(backend.clone(), store.clone()))
    }

    fn alice() -> Principal {
        Principal::new(1, "alice")
    }

    async fn signed_in() -> (Arc<FakeBackend>, Arc<MemoryTokenStore>, Arc<SessionManager>) {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        *backend.profile.lock().unwrap() = Some(alice());
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;
        session.login("alice", "secret").await.unwrap();
        (backend, store, session)
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_startup_without_credential() {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);

        assert!(session.is_loading());
        assert_eq!(session.phase(), Phase::Initializing);

        session.initialize().await;

        assert!(!session.is_loading());
        assert!(!session.is_authenticated());
        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_startup_with_valid_credential() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        session.initialize().await;

        assert!(session.is_authenticated());
        assert!(!session.is_loading());
        assert_eq!(session.principal(), Some(alice()));
        assert_eq!(session.authorization_header().as_deref(), Some("Bearer stored-token"));
        assert_eq!(store.load().unwrap().as_deref(), Some("stored-token"));
    }

    #[tokio::test]
    async fn test_startup_with_rejected_credential() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Invalid));
        let store = Arc::new(MemoryTokenStore::with_token("expired"));
        let session = manager(&backend, &store);

        session.initialize().await;

        assert!(!session.is_authenticated());
        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(session.bearer(), None);
    }

    #[tokio::test]
    async fn test_startup_fails_closed_on_transport_error() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Unreachable));
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        session.initialize().await;

        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(session.authorization_header(), None);
    }

    #[tokio::test]
    async fn test_bearer_withheld_while_verifying() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let gate = backend.gate_verify();
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        let mut updates = session.subscribe();
        updates.wait_for(|s| s.phase == Phase::Verifying).await.unwrap();

        assert!(session.is_loading());
        assert!(session.snapshot().has_credential);
        assert_eq!(session.bearer(), None);

        gate.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(session.bearer().as_deref(), Some("stored-token"));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        session.initialize().await;
        session.initialize().await;

        assert_eq!(backend.calls(), vec!["verify"]);
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_unreadable_store_starts_signed_out() {
        let backend = Arc::new(FakeBackend::default());
        let session = SessionManager::new(backend.clone(), Arc::new(BrokenStore));
        session.initialize().await;
        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        let (ready, ()) = tokio::join!(session.wait_until_ready(), session.initialize());
        assert!(!ready.is_loading());
        assert!(ready.is_authenticated());
    }

    // -------------------------------------------------------------------------
    // Login / register / logout
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_successful_login() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;

        session.login("alice", "secret").await.unwrap();

        assert_eq!(session.phase(), Phase::Authenticated);
        assert_eq!(session.principal(), Some(alice()));
        assert_eq!(store.load().unwrap().as_deref(), Some("abc123"));
        assert_eq!(session.authorization_header().as_deref(), Some("Bearer abc123"));
    }

    #[tokio::test]
    async fn test_failed_login_leaves_state_unchanged() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;
        let before = session.snapshot();

        let err = session.login("alice", "wrong").await.unwrap_err();

        assert_eq!(err.kind(), AuthErrorKind::InvalidCredential);
        assert_eq!(err.message(), "invalid credentials");
        assert_eq!(session.snapshot(), before);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_login_keeps_existing_session() {
        let (_backend, store, session) = signed_in().await;
        let before = session.snapshot();

        assert!(session.login("alice", "nope").await.is_err());

        assert_eq!(session.snapshot(), before);
        assert_eq!(store.load().unwrap().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);

        let err = session.login("   ", "secret").await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Validation);
        assert!(session.login("alice", "").await.is_err());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_login_survives_storage_failure() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let session = SessionManager::new(backend, Arc::new(BrokenStore));
        session.initialize().await;

        session.login("alice", "secret").await.unwrap();
        assert!(session.is_authenticated());

        session.logout();
        assert!(!session.is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_readable_while_credential_is_written() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let (saving_tx, saving_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let store = Arc::new(SlowStore {
            saving: Mutex::new(saving_tx),
            release: Mutex::new(release_rx),
            inner: MemoryTokenStore::new(),
        });
        let session = Arc::new(SessionManager::new(backend, store.clone()));
        session.initialize().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.login("alice", "secret").await }
        });
        saving_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The write is still blocked, yet the session answers
        assert_eq!(session.phase(), Phase::Authenticated);
        assert_eq!(session.bearer().as_deref(), Some("abc123"));
        assert_eq!(store.inner.load().unwrap(), None);

        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("abc123"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logout_during_credential_write_leaves_store_empty() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let (saving_tx, saving_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let store = Arc::new(SlowStore {
            saving: Mutex::new(saving_tx),
            release: Mutex::new(release_rx),
            inner: MemoryTokenStore::new(),
        });
        let session = Arc::new(SessionManager::new(backend, store.clone()));
        session.initialize().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.login("alice", "secret").await }
        });
        saving_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let logout = tokio::task::spawn_blocking({
            let session = session.clone();
            move || session.logout()
        });
        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        logout.await.unwrap();

        assert!(!session.is_authenticated());
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_register() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;

        let form = RegistrationForm {
            username: "bob".to_string(),
            email: "bob@example.com".to_string(),
            password: "Sturdy123".to_string(),
            ..RegistrationForm::default()
        };
        session.register(&form).await.unwrap();
        assert_eq!(session.principal().map(|p| p.username), Some("bob".to_string()));
        assert_eq!(store.load().unwrap().as_deref(), Some("reg-bob"));

        session.logout();
        let taken = RegistrationForm { username: "alice".to_string(), ..form.clone() };
        let err = session.register(&taken).await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredential);
        assert_eq!(err.message(), "Username already exists");
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_register_validates_before_sending() {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);

        let form = RegistrationForm {
            username: "bob".to_string(),
            email: "bob@example.com".to_string(),
            password: "short".to_string(),
            ..RegistrationForm::default()
        };
        let err = session.register(&form).await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Validation);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (_backend, store, session) = signed_in().await;

        session.logout();
        let once = session.snapshot();
        session.logout();

        assert_eq!(session.snapshot(), once);
        assert_eq!(once.phase, Phase::Unauthenticated);
        assert_eq!(once.principal, None);
        assert!(!once.has_credential);
        assert_eq!(session.bearer(), None);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_leaves_nothing_for_next_start() {
        let (backend, store, session) = signed_in().await;
        session.logout();
        drop(session);

        let fresh = manager(&backend, &store);
        fresh.initialize().await;

        assert!(!fresh.is_authenticated());
        assert!(!backend.calls().contains(&"verify"));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        let mut updates = session.subscribe();

        session.initialize().await;
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().phase, Phase::Unauthenticated);

        session.login("alice", "secret").await.unwrap();
        assert!(updates.borrow_and_update().is_authenticated());
    }

    // -------------------------------------------------------------------------
    // Out-of-order completions
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stale_verify_after_logout_is_ignored() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let gate = backend.gate_verify();
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        session
            .subscribe()
            .wait_for(|s| s.phase == Phase::Verifying)
            .await
            .unwrap();

        session.logout();
        gate.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert!(!session.is_authenticated());
        assert_eq!(session.bearer(), None);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_invalid_verify_does_not_undo_login() {
        let backend = Arc::new(
            FakeBackend::verifying(VerifyReply::Invalid).with_account("bob", "pw", "bob-token", 2),
        );
        let gate = backend.gate_verify();
        let store = Arc::new(MemoryTokenStore::with_token("old-token"));
        let session = manager(&backend, &store);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        session
            .subscribe()
            .wait_for(|s| s.phase == Phase::Verifying)
            .await
            .unwrap();

        session.login("bob", "pw").await.unwrap();
        gate.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(session.principal().map(|p| p.id), Some(2));
        assert_eq!(store.load().unwrap().as_deref(), Some("bob-token"));
        assert_eq!(session.bearer().as_deref(), Some("bob-token"));
    }

    #[tokio::test]
    async fn test_failed_login_during_verify_does_not_strand_loading() {
        let backend = Arc::new(FakeBackend::verifying(VerifyReply::Valid(alice())));
        let gate = backend.gate_verify();
        let store = Arc::new(MemoryTokenStore::with_token("stored-token"));
        let session = manager(&backend, &store);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        session
            .subscribe()
            .wait_for(|s| s.phase == Phase::Verifying)
            .await
            .unwrap();

        assert!(session.login("mallory", "guess").await.is_err());
        gate.send(()).unwrap();
        task.await.unwrap();

        assert!(!session.is_loading());
        assert_eq!(session.principal(), Some(alice()));
    }

    #[tokio::test]
    async fn test_login_finishing_after_logout_is_superseded() {
        let backend = Arc::new(FakeBackend::default().with_account("alice", "secret", "abc123", 1));
        let gate = backend.gate_login();
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.login("alice", "secret").await }
        });
        while !backend.calls().contains(&"login") {
            tokio::task::yield_now().await;
        }

        session.logout();
        gate.send(()).unwrap();
        let err = task.await.unwrap().unwrap_err();

        assert_eq!(err.kind(), AuthErrorKind::Superseded);
        assert!(!session.is_authenticated());
        assert_eq!(store.load().unwrap(), None);
    }

    // -------------------------------------------------------------------------
    // Account operations
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_account_operations_require_session() {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(&backend, &store);
        session.initialize().await;

        let err = session.refresh_principal().await.unwrap_err();
        assert_eq!(err.message(), "Not authenticated");
        assert!(session.delete_account().await.is_err());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_and_update_profile() {
        let (backend, _store, session) = signed_in().await;
        let mut richer = alice();
        richer.first_name = Some("Alice".to_string());
        *backend.profile.lock().unwrap() = Some(richer.clone());

        assert_eq!(session.refresh_principal().await.unwrap(), richer);
        assert_eq!(session.principal(), Some(richer));

        let update = ProfileUpdate {
            daily_goal_minutes: Some(90),
            ..ProfileUpdate::default()
        };
        let updated = session.update_profile(&update).await.unwrap();
        assert_eq!(updated.daily_goal_minutes, Some(90));
        assert_eq!(session.principal().and_then(|p| p.daily_goal_minutes), Some(90));
    }

    #[tokio::test]
    async fn test_unauthorized_refresh_signs_out() {
        let (backend, store, session) = signed_in().await;
        *backend.profile.lock().unwrap() = None;

        let err = session.refresh_principal().await.unwrap_err();

        assert_eq!(err.kind(), AuthErrorKind::InvalidCredential);
        assert_eq!(err.message(), "Failed to load profile");
        assert!(!session.is_authenticated());
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (backend, _store, session) = signed_in().await;

        let mismatch = PasswordChange {
            old_password: "Old12345".into(),
            new_password: "New12345".into(),
            confirm_new_password: "New1234".into(),
        };
        let err = session.change_password(&mismatch).await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Validation);
        assert!(!backend.calls().contains(&"change_password"));

        let wrong_old = PasswordChange {
            old_password: "Guess1234".into(),
            new_password: "New12345".into(),
            confirm_new_password: "New12345".into(),
        };
        let err = session.change_password(&wrong_old).await.unwrap_err();
        assert_eq!(err.message(), "Invalid old password");
        assert!(session.is_authenticated());

        let good = PasswordChange { old_password: "Old12345".into(), ..wrong_old };
        session.change_password(&good).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_account_signs_out() {
        let (_backend, store, session) = signed_in().await;

        session.delete_account().await.unwrap();

        assert_eq!(session.phase(), Phase::Unauthenticated);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_profile_refresh_does_not_discard_pending_login() {
        let (backend, store, session) = signed_in().await;
        backend.accounts.lock().unwrap().push((
            "bob".to_string(),
            "pw".to_string(),
            AuthGrant {
                token: "bob-token".to_string(),
                principal: Principal::new(2, "bob"),
            },
        ));
        let gate = backend.gate_login();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.login("bob", "pw").await }
        });
        while backend.calls().iter().filter(|c| **c == "login").count() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(session.refresh_principal().await.unwrap(), alice());
        gate.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(session.principal().map(|p| p.username), Some("bob".to_string()));
        assert_eq!(session.bearer().as_deref(), Some("bob-token"));
        assert_eq!(store.load().unwrap().as_deref(), Some("bob-token"));
    }

    #[tokio::test]
    async fn test_profile_answer_for_replaced_session_is_dropped() {
        let (_backend, _store, session) = signed_in().await;
        session.logout();

        // The token the profile call was made with is no longer active
        let err = session.replace_principal("abc123", alice()).unwrap_err();

        assert_eq!(err.kind(), AuthErrorKind::Superseded);
        assert_eq!(session.principal(), None);
        assert_eq!(session.phase(), Phase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_other_tokens() {
        let (_backend, _store, session) = signed_in().await;
        assert!(!session.invalidate("someone-else"));
        assert!(session.is_authenticated());
        assert!(session.invalidate("abc123"));
        assert!(!session.is_authenticated());
    }
}
