//! Perfect-negotiation bookkeeping.
//!
//! Pure state, no I/O: the session consults it before touching the peer
//! connection. Roles are fixed at construction: the later-created peer is
//! polite and yields on offer collisions; the earlier one is impolite,
//! ignores colliding offers, and is the only side that originates offers.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

/// Whether `local` is the polite peer against `remote`. Equal timestamps
/// fall back to comparing ids so both sides always agree.
pub fn is_polite(local: &PeerIdentity, remote: &PeerIdentity) -> bool {
    (local.created_at, &local.id) > (remote.created_at, &remote.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAction {
    /// Impolite side of a collision: drop the remote offer.
    Ignore,
    /// Apply the remote offer and answer it, rolling back our own pending
    /// offer first when there was a collision.
    Accept { rollback: bool },
}

#[derive(Debug)]
pub struct Negotiator {
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
}

impl Negotiator {
    pub fn new(local: &PeerIdentity, remote: &PeerIdentity) -> Self {
        Self {
            polite: is_polite(local, remote),
            making_offer: false,
            ignore_offer: false,
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    /// Only the impolite peer creates offers.
    pub fn may_offer(&self) -> bool {
        !self.polite
    }

    /// Claim the offer slot. Returns false if an offer is already in flight.
    pub fn begin_offer(&mut self) -> bool {
        if self.making_offer {
            return false;
        }
        self.making_offer = true;
        true
    }

    pub fn end_offer(&mut self) {
        self.making_offer = false;
    }

    /// Decide what to do with an incoming offer.
    pub fn on_offer(&mut self, signaling_stable: bool) -> OfferAction {
        let collision = self.making_offer || !signaling_stable;
        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            OfferAction::Ignore
        } else {
            OfferAction::Accept {
                rollback: collision,
            }
        }
    }

    /// Only the impolite peer applies answers.
    pub fn should_apply_answer(&self) -> bool {
        !self.polite
    }

    /// Candidate failures after an ignored offer are an expected race.
    pub fn swallow_candidate_error(&self) -> bool {
        self.ignore_offer
    }
}
