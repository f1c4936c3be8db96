//! Leader election over the quorum.
//!
//! Every client runs the same deterministic rule on the same ordered event
//! stream: the lowest interactive member id is the candidate, and only the
//! candidate proposes itself under the leader key. Once the proposal is
//! accepted everyone agrees on the leader.
//!
//! Every client tracks the agreed leader, but a client only proposes once
//! it takes part in the election, which happens when it registers tasks.
//! Leadership is scoped to a connection: [`LeaderElection::reset`] drops it.
//!
//! [`LeaderElection`] is a pure state machine. It returns the events to
//! publish and the actions to take; the runtime performs them.

use crate::quorum::{MemberDetails, QuorumEvent};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Where the election currently stands.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LeaderState {
    #[default]
    NoLeader,
    ProposalPending {
        candidate: String,
    },
    Leader(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionEvent {
    NewLeader(String),
    LeaderLeft(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionAction {
    /// Propose `value` under `key`.
    Propose { key: String, value: String },
    /// We lead and membership changed; redistribute tasks.
    AnalyzeTasks,
}

/// Output of one election step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElectionStep {
    pub events: Vec<ElectionEvent>,
    pub actions: Vec<ElectionAction>,
}

impl ElectionStep {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.actions.is_empty()
    }

    fn merge(&mut self, other: ElectionStep) {
        self.events.extend(other.events);
        self.actions.extend(other.actions);
    }
}

/// The lowest-ordered interactive member.
pub fn candidate(members: &BTreeMap<String, MemberDetails>) -> Option<&str> {
    members
        .iter()
        .find(|(_, details)| details.is_interactive())
        .map(|(id, _)| id.as_str())
}

#[derive(Debug)]
pub struct LeaderElection {
    leader_key: String,
    client_id: Option<String>,
    participating: bool,
    state: LeaderState,
}

impl LeaderElection {
    pub fn new(leader_key: impl Into<String>) -> Self {
        Self {
            leader_key: leader_key.into(),
            client_id: None,
            participating: false,
            state: LeaderState::NoLeader,
        }
    }

    /// An election this client takes part in.
    pub fn participating(leader_key: impl Into<String>) -> Self {
        let mut election = Self::new(leader_key);
        election.participating = true;
        election
    }

    pub fn state(&self) -> &LeaderState {
        &self.state
    }

    pub fn leader(&self) -> Option<&str> {
        match &self.state {
            LeaderState::Leader(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_leader(&self) -> bool {
        match (&self.state, &self.client_id) {
            (LeaderState::Leader(leader), Some(me)) => leader == me,
            _ => false,
        }
    }

    pub fn set_client_id(&mut self, client_id: Option<String>) {
        self.client_id = client_id;
    }

    pub fn is_participating(&self) -> bool {
        self.participating
    }

    /// Allow this client to propose itself when it is the candidate.
    pub fn set_participating(&mut self, participating: bool) {
        self.participating = participating;
    }

    /// Forget the connection: no client id, no leader.
    ///
    /// Reports [`ElectionEvent::LeaderLeft`] if this client was leading.
    pub fn reset(&mut self) -> ElectionStep {
        let mut step = ElectionStep::default();
        if self.is_leader() {
            if let Some(me) = self.client_id.clone() {
                step.events.push(ElectionEvent::LeaderLeft(me));
            }
        }
        self.state = LeaderState::NoLeader;
        self.client_id = None;
        step
    }

    /// Decide whether to propose, given the agreed leader value.
    ///
    /// An agreed value naming a current member is adopted as leader. Without
    /// one, a client that is not participating only waits.
    pub fn evaluate(
        &mut self,
        members: &BTreeMap<String, MemberDetails>,
        agreed: Option<&str>,
    ) -> ElectionStep {
        let mut step = ElectionStep::default();

        if let Some(leader) = agreed.filter(|leader| members.contains_key(*leader)) {
            if self.leader() != Some(leader) {
                self.state = LeaderState::Leader(leader.to_string());
                step.events.push(ElectionEvent::NewLeader(leader.to_string()));
                if self.is_leader() {
                    step.actions.push(ElectionAction::AnalyzeTasks);
                }
            }
            return step;
        }
        if let LeaderState::Leader(leader) = &self.state {
            if members.contains_key(leader) {
                return step;
            }
        }
        if !self.participating {
            return step;
        }

        let Some(candidate) = candidate(members).map(str::to_string) else {
            self.state = LeaderState::NoLeader;
            return step;
        };
        if matches!(&self.state, LeaderState::ProposalPending { candidate: pending } if *pending == candidate)
        {
            return step;
        }

        debug!(candidate = %candidate, "Leader candidate selected");
        if self.client_id.as_deref() == Some(candidate.as_str()) {
            step.actions.push(ElectionAction::Propose {
                key: self.leader_key.clone(),
                value: candidate.clone(),
            });
        }
        self.state = LeaderState::ProposalPending { candidate };
        step
    }

    /// Apply a quorum event. `members` is the membership after the event.
    pub fn handle(
        &mut self,
        event: &QuorumEvent,
        members: &BTreeMap<String, MemberDetails>,
    ) -> ElectionStep {
        let mut step = ElectionStep::default();
        match event {
            QuorumEvent::ProposalAccepted { key, value } if *key == self.leader_key => {
                self.state = LeaderState::Leader(value.clone());
                step.events.push(ElectionEvent::NewLeader(value.clone()));
                if self.is_leader() {
                    step.actions.push(ElectionAction::AnalyzeTasks);
                }
            }
            QuorumEvent::ProposalRejected { key, value } if *key == self.leader_key => {
                warn!(candidate = %value, "Leadership proposal rejected");
                if matches!(&self.state, LeaderState::ProposalPending { candidate } if candidate == value)
                {
                    self.state = LeaderState::NoLeader;
                }
            }
            QuorumEvent::MemberLeft { client_id } => {
                if self.leader() == Some(client_id.as_str()) {
                    self.state = LeaderState::NoLeader;
                    step.events.push(ElectionEvent::LeaderLeft(client_id.clone()));
                    step.merge(self.evaluate(members, None));
                } else if self.is_leader() {
                    step.actions.push(ElectionAction::AnalyzeTasks);
                } else if matches!(&self.state, LeaderState::ProposalPending { candidate } if candidate == client_id)
                {
                    self.state = LeaderState::NoLeader;
                    step.merge(self.evaluate(members, None));
                }
            }
            QuorumEvent::MemberJoined { .. } => {
                if self.is_leader() {
                    step.actions.push(ElectionAction::AnalyzeTasks);
                } else if self.state == LeaderState::NoLeader {
                    step.merge(self.evaluate(members, None));
                }
            }
            _ => {}
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> BTreeMap<String, MemberDetails> {
        ids.iter()
            .map(|id| (id.to_string(), MemberDetails::interactive()))
            .collect()
    }

    fn elected(client: &str, leader: &str, members: &BTreeMap<String, MemberDetails>) -> LeaderElection {
        let mut election = LeaderElection::participating("leader");
        election.set_client_id(Some(client.to_string()));
        election.evaluate(members, Some(leader));
        election
    }

    #[test]
    fn test_only_candidate_proposes() {
        let all = members(&["a", "b", "c"]);
        let mut a = LeaderElection::participating("leader");
        a.set_client_id(Some("a".into()));
        let mut b = LeaderElection::participating("leader");
        b.set_client_id(Some("b".into()));

        let step = a.evaluate(&all, None);
        assert_eq!(
            step.actions,
            vec![ElectionAction::Propose {
                key: "leader".into(),
                value: "a".into()
            }]
        );
        assert!(b.evaluate(&all, None).actions.is_empty());
        assert_eq!(
            *b.state(),
            LeaderState::ProposalPending {
                candidate: "a".into()
            }
        );
    }

    #[test]
    fn test_agents_never_candidates() {
        let mut all = members(&["b"]);
        all.insert("a".into(), MemberDetails::agent("intel"));
        assert_eq!(candidate(&all), Some("b"));
    }

    #[test]
    fn test_accepted_proposal_elects() {
        let all = members(&["a", "b"]);
        let mut a = LeaderElection::participating("leader");
        a.set_client_id(Some("a".into()));
        a.evaluate(&all, None);

        let step = a.handle(
            &QuorumEvent::ProposalAccepted {
                key: "leader".into(),
                value: "a".into(),
            },
            &all,
        );
        assert_eq!(step.events, vec![ElectionEvent::NewLeader("a".into())]);
        assert_eq!(step.actions, vec![ElectionAction::AnalyzeTasks]);
        assert!(a.is_leader());
    }

    #[test]
    fn test_leader_departure_hands_over_to_next_candidate() {
        let after = members(&["b", "c"]);
        let left = QuorumEvent::MemberLeft {
            client_id: "a".into(),
        };

        let mut b = elected("b", "a", &members(&["a", "b", "c"]));
        let mut c = elected("c", "a", &members(&["a", "b", "c"]));

        let step_b = b.handle(&left, &after);
        let step_c = c.handle(&left, &after);

        assert_eq!(step_b.events, vec![ElectionEvent::LeaderLeft("a".into())]);
        assert_eq!(
            step_b.actions,
            vec![ElectionAction::Propose {
                key: "leader".into(),
                value: "b".into()
            }]
        );
        assert_eq!(step_c.events, vec![ElectionEvent::LeaderLeft("a".into())]);
        assert!(step_c.actions.is_empty());
    }

    #[test]
    fn test_leader_reanalyzes_on_membership_change() {
        let all = members(&["a", "b"]);
        let mut a = elected("a", "a", &all);

        let step = a.handle(
            &QuorumEvent::MemberJoined {
                client_id: "robot".into(),
                details: MemberDetails::agent("intel"),
            },
            &all,
        );
        assert_eq!(step.actions, vec![ElectionAction::AnalyzeTasks]);

        let step = a.handle(
            &QuorumEvent::MemberLeft {
                client_id: "b".into(),
            },
            &members(&["a"]),
        );
        assert_eq!(step.actions, vec![ElectionAction::AnalyzeTasks]);
    }

    #[test]
    fn test_rejection_is_not_fatal() {
        let all = members(&["a"]);
        let mut a = LeaderElection::participating("leader");
        a.set_client_id(Some("a".into()));
        a.evaluate(&all, None);

        let step = a.handle(
            &QuorumEvent::ProposalRejected {
                key: "leader".into(),
                value: "a".into(),
            },
            &all,
        );
        assert!(step.is_empty());
        assert_eq!(*a.state(), LeaderState::NoLeader);
    }

    #[test]
    fn test_observer_adopts_leader_without_proposing() {
        let all = members(&["a", "b"]);
        let mut a = LeaderElection::new("leader");
        a.set_client_id(Some("a".into()));

        assert!(a.evaluate(&all, None).is_empty());
        assert_eq!(*a.state(), LeaderState::NoLeader);

        let step = a.evaluate(&all, Some("b"));
        assert_eq!(step.events, vec![ElectionEvent::NewLeader("b".into())]);
        assert!(step.actions.is_empty());

        a.set_participating(true);
        let step = a.handle(
            &QuorumEvent::MemberLeft {
                client_id: "b".into(),
            },
            &members(&["a"]),
        );
        assert_eq!(
            step.actions,
            vec![ElectionAction::Propose {
                key: "leader".into(),
                value: "a".into()
            }]
        );
    }

    #[test]
    fn test_reset_drops_leadership() {
        let all = members(&["a", "b"]);
        let mut a = elected("a", "a", &all);
        assert!(a.is_leader());

        let step = a.reset();
        assert_eq!(step.events, vec![ElectionEvent::LeaderLeft("a".into())]);
        assert!(!a.is_leader());
        assert_eq!(a.leader(), None);
        assert!(a.is_participating());

        let mut b = elected("b", "a", &all);
        assert!(b.reset().is_empty());
        assert_eq!(*b.state(), LeaderState::NoLeader);
    }
}
