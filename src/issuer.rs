//! # Identity & Key Issuer (TTP)
//!
//! The issuer admits nodes into the overlay. For each admitted address it
//! assigns a numID and a nameID that are unique among registered nodes, and
//! derives identity-bound key material from its master key.
//!
//! ## Assignment policy
//!
//! - numID: uniform draw from `[0, capacity)`.
//! - nameID: uniform draw from all `name_id_bits`-wide bit strings.
//!
//! A draw that collides with a live assignment moves forward (wrapping) to the
//! next free value. Because fewer than `capacity` values are ever taken, the
//! scan is bounded by the number of live registrations. All allocation happens
//! under one mutex, so concurrent registrations never observe each other's
//! half-finished state.
//!
//! Randomness comes from the `StdRng` handed to [`Issuer::new`]; a fixed seed
//! reproduces the same assignments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SystemParameters;
use crate::crypto::{MasterKey, PrivateKey, PublicParameters};
use crate::error::{RegistrationError, SkipGraphResult};
use crate::identity::{NameId, NodeInfo, NumId};

/// Everything a node receives when it is admitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub node: NodeInfo,
    pub private_key: PrivateKey,
    pub public_parameters: PublicParameters,
    pub system_parameters: SystemParameters,
}

struct IssuerState {
    params: SystemParameters,
    master: MasterKey,
    rng: StdRng,
    nodes: BTreeMap<NumId, NodeInfo>,
    names: HashSet<NameId>,
    addresses: HashMap<String, NumId>,
}

impl IssuerState {
    fn admit(&mut self, node: NodeInfo) -> Registration {
        let private_key = self.master.issue(&node);
        self.names.insert(node.name_id.clone());
        self.addresses.insert(node.address.clone(), node.num_id);
        self.nodes.insert(node.num_id, node.clone());
        Registration {
            node,
            private_key,
            public_parameters: self.master.public_parameters(),
            system_parameters: self.params.clone(),
        }
    }

    fn release(&mut self, num_id: NumId) -> Result<NodeInfo, RegistrationError> {
        let node = self
            .nodes
            .remove(&num_id)
            .ok_or(RegistrationError::UnknownNode { num_id })?;
        self.names.remove(&node.name_id);
        self.addresses.remove(&node.address);
        info!(num_id, address = %node.address, "deregistered node");
        Ok(node)
    }

    fn check_admissible(&self, address: &str) -> Result<(), RegistrationError> {
        if self.addresses.contains_key(address) {
            return Err(RegistrationError::AlreadyRegistered {
                address: address.to_string(),
            });
        }
        if self.nodes.len() as u64 >= self.params.capacity {
            return Err(RegistrationError::CapacityExhausted {
                capacity: self.params.capacity,
            });
        }
        Ok(())
    }
}

/// Picks a uniformly random starting point in `[0, space)` and returns the
/// first value at or after it (wrapping) that is not taken.
fn draw_free(rng: &mut StdRng, space: u64, taken: impl Fn(u64) -> bool) -> Option<u64> {
    if space == 0 {
        return None;
    }
    let start = rng.gen_range(0..space);
    (0..space)
        .map(|offset| (start + offset) % space)
        .find(|candidate| !taken(*candidate))
}

/// Cheap-to-clone handle to the issuing authority.
#[derive(Clone)]
pub struct Issuer {
    state: Arc<Mutex<IssuerState>>,
}

impl Issuer {
    pub fn new(params: SystemParameters, mut rng: StdRng) -> SkipGraphResult<Self> {
        params.validate()?;
        let master = MasterKey::generate(&mut rng);
        info!(
            capacity = params.capacity,
            name_id_bits = params.name_id_bits,
            public = ?master.public_parameters(),
            "issuer initialized"
        );
        Ok(Self {
            state: Arc::new(Mutex::new(IssuerState {
                params,
                master,
                rng,
                nodes: BTreeMap::new(),
                names: HashSet::new(),
                addresses: HashMap::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, IssuerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Register()`: admits `address` with freshly drawn identifiers.
    pub fn register(&self, address: &str) -> Result<Registration, RegistrationError> {
        let mut state = self.lock();
        if let Err(e) = state.check_admissible(address) {
            warn!(address, error = %e, "registration rejected");
            return Err(e);
        }

        let capacity = state.params.capacity;
        let bits = state.params.name_id_bits;
        let IssuerState {
            rng, nodes, names, ..
        } = &mut *state;

        let num_id = draw_free(rng, capacity, |n| nodes.contains_key(&n)).ok_or(
            RegistrationError::CapacityExhausted { capacity },
        )?;
        let name_value = draw_free(rng, 1u64 << bits, |v| {
            NameId::from_value(v, bits).is_ok_and(|name| names.contains(&name))
        })
        .ok_or(RegistrationError::CapacityExhausted { capacity })?;
        let name_id = NameId::from_value(name_value, bits)
            .map_err(|e| RegistrationError::InvalidIdentifier(e.to_string()))?;

        let registration = state.admit(NodeInfo::new(num_id, name_id, address));
        info!(
            num_id,
            name_id = %registration.node.name_id,
            address,
            "registered node"
        );
        Ok(registration)
    }

    /// Admits `address` under caller-chosen identifiers, subject to the same
    /// uniqueness and capacity rules as [`Issuer::register`].
    pub fn register_as(
        &self,
        address: &str,
        num_id: NumId,
        name_id: NameId,
    ) -> Result<Registration, RegistrationError> {
        let mut state = self.lock();
        state.check_admissible(address)?;
        if name_id.len() != state.params.name_id_bits {
            return Err(RegistrationError::InvalidIdentifier(format!(
                "name id {} must be {} bits wide",
                name_id, state.params.name_id_bits
            )));
        }
        if state.nodes.contains_key(&num_id) {
            return Err(RegistrationError::IdentifierTaken(format!("numID {num_id}")));
        }
        if state.names.contains(&name_id) {
            return Err(RegistrationError::IdentifierTaken(format!("nameID {name_id}")));
        }

        let registration = state.admit(NodeInfo::new(num_id, name_id, address));
        info!(
            num_id,
            name_id = %registration.node.name_id,
            address,
            "registered node with assigned identifiers"
        );
        Ok(registration)
    }

    /// Releases the identifiers of a terminated node.
    pub fn deregister(&self, num_id: NumId) -> Result<NodeInfo, RegistrationError> {
        self.lock().release(num_id)
    }

    /// Like [`Issuer::deregister`], but only on behalf of the address that
    /// registered `num_id`.
    pub fn deregister_from(&self, address: &str, num_id: NumId) -> Result<NodeInfo, RegistrationError> {
        let mut state = self.lock();
        let owned = state.nodes.get(&num_id).map(|node| node.address == address);
        match owned {
            Some(true) => state.release(num_id),
            Some(false) => {
                warn!(num_id, address, "deregistration by a foreign address rejected");
                Err(RegistrationError::NotOwner {
                    num_id,
                    address: address.to_string(),
                })
            }
            None => Err(RegistrationError::UnknownNode { num_id }),
        }
    }

    /// Destroys every identity record and rotates the master key.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.nodes.clear();
        state.names.clear();
        state.addresses.clear();
        let IssuerState { rng, master, .. } = &mut *state;
        *master = MasterKey::generate(rng);
        debug!(public = ?state.master.public_parameters(), "issuer reset");
    }

    pub fn public_parameters(&self) -> PublicParameters {
        self.lock().master.public_parameters()
    }

    pub fn registered(&self) -> Vec<NodeInfo> {
        self.lock().nodes.values().cloned().collect()
    }
}
