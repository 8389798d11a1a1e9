//! Eviction plan generation.
//!
//! Maps a mutation to every cache entry whose namespace covers it.

use std::collections::BTreeSet;
use std::fmt;

use super::events::Mutation;
use super::keys::{CacheKey, Namespace};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Individual entries to drop.
    pub keys: BTreeSet<CacheKey>,
    /// Namespaces whose keys cannot be enumerated from the mutation
    /// (listing signatures), dropped wholesale.
    pub namespaces: BTreeSet<Namespace>,
}

impl fmt::Display for EvictionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EvictionPlan {{ keys: {}, namespaces: {} }}",
            self.keys.len(),
            self.namespaces.len()
        )
    }
}

impl EvictionPlan {
    pub fn for_mutation(mutation: &Mutation) -> Self {
        let mut plan = Self::default();

        match mutation {
            Mutation::RequestCreated { volunteer, .. } => {
                plan.keys.insert(CacheKey::requests_of_volunteer(volunteer));
            }
            Mutation::RequestDeleted {
                volunteer,
                post_id,
                org_email,
                slots_changed,
            } => {
                plan.keys.insert(CacheKey::requests_of_volunteer(volunteer));
                if *slots_changed {
                    plan.keys.insert(CacheKey::post_by_id(*post_id));
                    if let Some(org_email) = org_email {
                        plan.keys.insert(CacheKey::posts_of_org(org_email));
                    }
                    plan.add_listings();
                }
            }
            Mutation::RequestReviewed {
                volunteer,
                post_id,
                org_email,
                slots_changed,
            } => {
                plan.keys.insert(CacheKey::requests_of_volunteer(volunteer));
                plan.keys.insert(CacheKey::post_by_id(*post_id));
                plan.keys.insert(CacheKey::posts_of_org(org_email));
                if *slots_changed {
                    plan.add_listings();
                }
            }
        }

        plan
    }

    fn add_listings(&mut self) {
        self.namespaces.insert(Namespace::Posts);
        self.namespaces.insert(Namespace::HomeTop);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.namespaces.is_empty()
    }
}
