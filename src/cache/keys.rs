//! Cache key types.
//!
//! Keys are semantic query signatures: a namespace naming the query family
//! plus a key identifying one instance of it. Email components are always
//! lower-cased so differently-cased lookups share an entry.

use std::fmt;

use crate::domain::identity::VolunteerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Single post detail, keyed by post id.
    PostById,
    /// Posts owned by one organizer, keyed by organizer email.
    PostsOfOrg,
    /// Requests submitted by one volunteer, keyed by volunteer email.
    RequestsOfVolunteer,
    /// Public post listings, keyed by query signature.
    Posts,
    /// Home page highlights, keyed by query signature.
    HomeTop,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::PostById,
        Namespace::PostsOfOrg,
        Namespace::RequestsOfVolunteer,
        Namespace::Posts,
        Namespace::HomeTop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::PostById => "post-by-id",
            Namespace::PostsOfOrg => "posts-of-org",
            Namespace::RequestsOfVolunteer => "requests-of-volunteer",
            Namespace::Posts => "posts",
            Namespace::HomeTop => "home-top",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: Namespace,
    key: String,
}

impl CacheKey {
    pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
        }
    }

    pub fn post_by_id(post_id: i64) -> Self {
        Self::new(Namespace::PostById, post_id.to_string())
    }

    pub fn posts_of_org(org_email: &str) -> Self {
        Self::new(Namespace::PostsOfOrg, org_email.trim().to_lowercase())
    }

    pub fn requests_of_volunteer(volunteer: &VolunteerIdentity) -> Self {
        Self::new(Namespace::RequestsOfVolunteer, volunteer.as_str())
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}
