//! Route protection as a pure decision.
//!
//! `decide` maps a session, the capability a route requires and the path being visited
//! to a `RouteGuardDecision`. Whoever hosts the route (the HTTP middleware, a client
//! view through `RouteGate`) only acts on the decision.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::session::{RoleState, Session, SessionResolver, SessionSubscription};

pub const HOME_PATH: &str = "/";
pub const LOGIN_PATH: &str = "/login";
/// Where admin-capable users land after signing in.
pub const ADMIN_ENTRY_PATH: &str = "/admin";
/// Where everyone else lands when no return path was remembered.
pub const DEFAULT_LANDING_PATH: &str = "/profile";

/// Capability
///
/// The access level a route requires. Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Authenticated,
    /// `Admin` or `SuperAdmin`.
    Admin,
}

/// RouteGuardDecision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteGuardDecision {
    /// The session is not settled yet; render nothing and redirect nowhere.
    Pending,
    Allow,
    RedirectToLogin { return_path: String },
    /// Used by admin routes so their existence is not revealed.
    RedirectToHome,
}

/// decide
///
/// Fails closed: an unknown role never satisfies `Admin`, a failed role lookup is
/// treated as no role, and `Allow` is only returned for a settled session.
pub fn decide(session: &Session, capability: Capability, current_path: &str) -> RouteGuardDecision {
    match (capability, session) {
        (_, Session::Unresolved) => RouteGuardDecision::Pending,

        (Capability::Authenticated, Session::Anonymous) => RouteGuardDecision::RedirectToLogin {
            return_path: current_path.to_string(),
        },
        (Capability::Authenticated, Session::Authenticated { .. }) => RouteGuardDecision::Allow,

        (Capability::Admin, Session::Anonymous) => RouteGuardDecision::RedirectToHome,
        (Capability::Admin, Session::Authenticated { role, .. }) => match role {
            RoleState::Unknown => RouteGuardDecision::Pending,
            RoleState::Resolved(Some(role)) if role.is_admin() => RouteGuardDecision::Allow,
            RoleState::Resolved(_) | RoleState::Failed => RouteGuardDecision::RedirectToHome,
        },
    }
}

/// Strips the query string and any trailing slash (except for the root).
fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// True if `path` is `base` or lies beneath it.
fn is_within(path: &str, base: &str) -> bool {
    let path = normalize(path);
    path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteRule {
    path: String,
    /// Also covers everything beneath `path`.
    subtree: bool,
    capability: Capability,
}

/// RouteTable
///
/// Which paths are protected and by what capability. Unlisted paths are public.
/// When several rules match, the most restrictive one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl Default for RouteTable {
    /// The portal's protected pages: the whole admin area plus the member pages.
    fn default() -> Self {
        RouteTable::new()
            .protect_tree(ADMIN_ENTRY_PATH, Capability::Admin)
            .protect("/profile", Capability::Authenticated)
            .protect("/favorites", Capability::Authenticated)
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn protect(mut self, path: &str, capability: Capability) -> Self {
        self.rules.push(RouteRule {
            path: normalize(path).to_string(),
            subtree: false,
            capability,
        });
        self
    }

    pub fn protect_tree(mut self, path: &str, capability: Capability) -> Self {
        self.rules.push(RouteRule {
            path: normalize(path).to_string(),
            subtree: true,
            capability,
        });
        self
    }

    pub fn required_capability(&self, path: &str) -> Option<Capability> {
        self.rules
            .iter()
            .filter(|rule| {
                if rule.subtree {
                    is_within(path, &rule.path)
                } else {
                    normalize(path) == rule.path
                }
            })
            .map(|rule| rule.capability)
            .max()
    }

    /// Decision for visiting `path`; public paths are always allowed.
    pub fn decide(&self, session: &Session, path: &str) -> RouteGuardDecision {
        match self.required_capability(path) {
            Some(capability) => decide(session, capability, path),
            None => RouteGuardDecision::Allow,
        }
    }
}

/// A return path is only honoured if it stays on this site.
pub fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.contains('\\')
}

/// post_login_destination
///
/// Where the sign-in flow sends a visitor once authenticated: back to the remembered
/// path, except that admin-capable users whose login did not start from the admin
/// area go to the admin entry point.
pub fn post_login_destination(return_path: Option<&str>, session: &Session) -> String {
    let remembered = return_path.filter(|path| is_local_path(path));

    if session.is_admin() && !remembered.is_some_and(|path| is_within(path, ADMIN_ENTRY_PATH)) {
        return ADMIN_ENTRY_PATH.to_string();
    }
    remembered.unwrap_or(DEFAULT_LANDING_PATH).to_string()
}

/// login_location
///
/// The sign-in URL carrying `return_path` as its `redirect` parameter.
pub fn login_location(return_path: &str) -> String {
    match Url::parse_with_params("http://localhost/login", &[("redirect", return_path)]) {
        Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or_default()),
        Err(_) => LOGIN_PATH.to_string(),
    }
}

/// RouteGate
///
/// A mounted protected view. It keeps a subscription to the session and recomputes
/// its decision on every transition, so a sign-out revokes access while mounted.
pub struct RouteGate {
    capability: Capability,
    path: String,
    subscription: SessionSubscription,
    last: RouteGuardDecision,
}

impl RouteGate {
    pub fn mount(resolver: &SessionResolver, capability: Capability, path: &str) -> Self {
        let subscription = resolver.subscribe();
        let last = decide(&subscription.current(), capability, path);
        Self {
            capability,
            path: path.to_string(),
            subscription,
            last,
        }
    }

    pub fn decision(&self) -> RouteGuardDecision {
        self.last.clone()
    }

    /// Waits until the decision differs from the last one observed and returns it.
    /// `None` once the resolver has been dropped.
    pub async fn next_decision(&mut self) -> Option<RouteGuardDecision> {
        loop {
            let session = self.subscription.changed().await?;
            let decision = decide(&session, self.capability, &self.path);
            if decision != self.last {
                self.last = decision.clone();
                return Some(decision);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use uuid::Uuid;

    fn signed_in(role: RoleState) -> Session {
        Session::Authenticated {
            user_id: Uuid::from_u128(9),
            role,
        }
    }

    #[test]
    fn unresolved_session_is_pending_for_every_capability() {
        for capability in [Capability::Authenticated, Capability::Admin] {
            assert_eq!(
                decide(&Session::Unresolved, capability, "/admin/quotes"),
                RouteGuardDecision::Pending
            );
        }
    }

    #[test]
    fn admin_gate_outcomes() {
        let subscriber = signed_in(RoleState::Resolved(Some(Role::Subscriber)));
        let admin = signed_in(RoleState::Resolved(Some(Role::Admin)));
        let superadmin = signed_in(RoleState::Resolved(Some(Role::SuperAdmin)));

        assert_eq!(decide(&subscriber, Capability::Admin, "/admin"), RouteGuardDecision::RedirectToHome);
        assert_eq!(decide(&admin, Capability::Admin, "/admin"), RouteGuardDecision::Allow);
        assert_eq!(decide(&superadmin, Capability::Admin, "/admin"), RouteGuardDecision::Allow);
        assert_eq!(
            decide(&Session::Anonymous, Capability::Admin, "/admin"),
            RouteGuardDecision::RedirectToHome
        );
    }

    #[test]
    fn admin_gate_fails_closed() {
        assert_eq!(
            decide(&signed_in(RoleState::Failed), Capability::Admin, "/admin"),
            RouteGuardDecision::RedirectToHome
        );
        assert_eq!(
            decide(&signed_in(RoleState::Resolved(None)), Capability::Admin, "/admin"),
            RouteGuardDecision::RedirectToHome
        );
        assert_eq!(
            decide(&signed_in(RoleState::Unknown), Capability::Admin, "/admin"),
            RouteGuardDecision::Pending
        );
    }

    #[test]
    fn authenticated_gate_remembers_the_path() {
        assert_eq!(
            decide(&Session::Anonymous, Capability::Authenticated, "/favorites"),
            RouteGuardDecision::RedirectToLogin {
                return_path: "/favorites".to_string()
            }
        );
        assert_eq!(
            decide(&signed_in(RoleState::Failed), Capability::Authenticated, "/favorites"),
            RouteGuardDecision::Allow
        );
    }

    #[test]
    fn route_table_matches_admin_subtree_and_member_pages() {
        let table = RouteTable::default();
        assert_eq!(table.required_capability("/admin"), Some(Capability::Admin));
        assert_eq!(table.required_capability("/admin/quotes/"), Some(Capability::Admin));
        assert_eq!(table.required_capability("/administrator"), None);
        assert_eq!(table.required_capability("/profile?tab=1"), Some(Capability::Authenticated));
        assert_eq!(table.required_capability("/quotes"), None);
        assert_eq!(table.decide(&Session::Unresolved, "/about"), RouteGuardDecision::Allow);
    }

    #[test]
    fn most_restrictive_rule_wins() {
        let table = RouteTable::new()
            .protect_tree("/members", Capability::Authenticated)
            .protect("/members/billing", Capability::Admin);
        assert_eq!(table.required_capability("/members/billing"), Some(Capability::Admin));
        assert_eq!(table.required_capability("/members/home"), Some(Capability::Authenticated));
    }

    #[test]
    fn post_login_honours_return_path() {
        let member = signed_in(RoleState::Resolved(Some(Role::Editor)));
        assert_eq!(post_login_destination(Some("/favorites"), &member), "/favorites");
        assert_eq!(post_login_destination(None, &member), DEFAULT_LANDING_PATH);
        assert_eq!(post_login_destination(Some("//evil.example"), &member), DEFAULT_LANDING_PATH);
    }

    #[test]
    fn admins_land_on_admin_entry_unless_they_came_from_admin() {
        let admin = signed_in(RoleState::Resolved(Some(Role::Admin)));
        assert_eq!(post_login_destination(Some("/favorites"), &admin), ADMIN_ENTRY_PATH);
        assert_eq!(post_login_destination(None, &admin), ADMIN_ENTRY_PATH);
        assert_eq!(post_login_destination(Some("/admin/authors"), &admin), "/admin/authors");
    }

    #[test]
    fn login_location_encodes_the_return_path() {
        assert_eq!(login_location("/profile"), "/login?redirect=%2Fprofile");
        assert_eq!(
            login_location("/favorites?x=1&y=2"),
            "/login?redirect=%2Ffavorites%3Fx%3D1%26y%3D2"
        );
    }
}
