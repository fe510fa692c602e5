//! Test doubles: a deterministic backend, a recording loopback transport and
//! a harness gluing them to an [`Ibft`] instance.
use crate::{
    messages::{
        CommittedSeal, Message, MessageType, Payload, PrePrepareData, PreparedCertificate,
        Proposal, ProposalHash, RawProposal, RoundChangeCertificate, RoundChangeData, ValidatorId,
        View,
    },
    Backend, Config, Ibft, Transport,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use zksync_concurrency::{ctx, time};

/// Backend over a set of `n` validators with single-byte identifiers.
/// The proposer of `(height, round)` is validator `(height + round) % n`;
/// the proposal hash is the raw body behind a fixed prefix; seals are the
/// signer concatenated with the hash.
#[derive(Debug)]
pub(crate) struct TestBackend {
    pub(crate) id: ValidatorId,
    pub(crate) validators: Vec<ValidatorId>,
    /// Proposals handed over for insertion, with their seals.
    pub(crate) finalized: Mutex<Vec<(Proposal, Vec<CommittedSeal>)>>,
}

impl TestBackend {
    pub(crate) fn new(n: usize, local: usize) -> Self {
        let validators: Vec<_> = (0..n).map(|i| ValidatorId(vec![i as u8])).collect();
        Self {
            id: validators[local].clone(),
            validators,
            finalized: Mutex::default(),
        }
    }

    /// Quorum threshold for everything except pre-prepare messages.
    pub(crate) fn quorum(&self) -> usize {
        2 * self.validators.len() / 3 + 1
    }

    pub(crate) fn proposer(&self, height: u64, round: u64) -> &ValidatorId {
        &self.validators[((height + round) % self.validators.len() as u64) as usize]
    }

    pub(crate) fn hash(raw_proposal: &[u8]) -> ProposalHash {
        ProposalHash([b"hash:".as_slice(), raw_proposal].concat())
    }

    /// The proposal body this backend builds for `view`.
    pub(crate) fn raw_proposal(view: View) -> RawProposal {
        format!("block-{}-{}", view.height, view.round).into_bytes()
    }

    fn seal(&self, proposal_hash: &ProposalHash) -> CommittedSeal {
        CommittedSeal {
            signer: self.id.0.clone(),
            signature: [self.id.0.as_slice(), proposal_hash.0.as_slice()].concat(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for TestBackend {
    fn id(&self) -> ValidatorId {
        self.id.clone()
    }

    fn is_proposer(&self, id: &ValidatorId, height: u64, round: u64) -> bool {
        self.proposer(height, round) == id
    }

    fn is_valid_validator(&self, message: &Message) -> bool {
        self.validators.contains(&message.from)
    }

    fn is_valid_proposal(&self, _raw_proposal: &[u8]) -> bool {
        true
    }

    fn is_valid_proposal_hash(&self, proposal: &Proposal, hash: &ProposalHash) -> bool {
        Self::hash(&proposal.raw_proposal) == *hash
    }

    fn is_valid_committed_seal(&self, proposal_hash: &ProposalHash, seal: &CommittedSeal) -> bool {
        seal.signature == [seal.signer.as_slice(), proposal_hash.0.as_slice()].concat()
    }

    fn has_quorum(&self, _height: u64, messages: &[Message], message_type: MessageType) -> bool {
        match message_type {
            MessageType::PrePrepare => !messages.is_empty(),
            _ => {
                let senders: HashSet<_> = messages.iter().map(|msg| &msg.from).collect();
                senders.len() >= self.quorum()
            }
        }
    }

    async fn build_proposal(&self, _ctx: &ctx::Ctx, view: View) -> ctx::Result<RawProposal> {
        Ok(Self::raw_proposal(view))
    }

    fn build_pre_prepare_message(
        &self,
        raw_proposal: RawProposal,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Message {
        Message {
            from: self.id.clone(),
            view,
            payload: Payload::PrePrepare(PrePrepareData {
                proposal_hash: Self::hash(&raw_proposal),
                proposal: Proposal {
                    raw_proposal,
                    round: view.round,
                },
                certificate,
            }),
        }
    }

    fn build_prepare_message(&self, proposal_hash: ProposalHash, view: View) -> Message {
        Message {
            from: self.id.clone(),
            view,
            payload: Payload::Prepare { proposal_hash },
        }
    }

    fn build_commit_message(&self, proposal_hash: ProposalHash, view: View) -> Message {
        Message {
            from: self.id.clone(),
            view,
            payload: Payload::Commit {
                committed_seal: self.seal(&proposal_hash),
                proposal_hash,
            },
        }
    }

    fn build_round_change_message(
        &self,
        last_prepared_proposal: Option<Proposal>,
        latest_pc: Option<PreparedCertificate>,
        view: View,
    ) -> Message {
        Message {
            from: self.id.clone(),
            view,
            payload: Payload::RoundChange(RoundChangeData {
                last_prepared_proposal,
                latest_prepared_certificate: latest_pc.map(Box::new),
            }),
        }
    }

    async fn insert_proposal(
        &self,
        _ctx: &ctx::Ctx,
        proposal: Proposal,
        committed_seals: Vec<CommittedSeal>,
    ) -> ctx::Result<()> {
        self.finalized
            .lock()
            .unwrap()
            .push((proposal, committed_seals));
        Ok(())
    }
}

/// Backend that refuses to build proposals; everything else is delegated.
#[derive(Debug)]
pub(crate) struct FailingProposalBackend(pub(crate) TestBackend);

#[async_trait::async_trait]
impl Backend for FailingProposalBackend {
    fn id(&self) -> ValidatorId {
        self.0.id()
    }

    fn is_proposer(&self, id: &ValidatorId, height: u64, round: u64) -> bool {
        self.0.is_proposer(id, height, round)
    }

    fn is_valid_validator(&self, message: &Message) -> bool {
        self.0.is_valid_validator(message)
    }

    fn is_valid_proposal(&self, raw_proposal: &[u8]) -> bool {
        self.0.is_valid_proposal(raw_proposal)
    }

    fn is_valid_proposal_hash(&self, proposal: &Proposal, hash: &ProposalHash) -> bool {
        self.0.is_valid_proposal_hash(proposal, hash)
    }

    fn is_valid_committed_seal(&self, proposal_hash: &ProposalHash, seal: &CommittedSeal) -> bool {
        self.0.is_valid_committed_seal(proposal_hash, seal)
    }

    fn has_quorum(&self, height: u64, messages: &[Message], message_type: MessageType) -> bool {
        self.0.has_quorum(height, messages, message_type)
    }

    async fn build_proposal(&self, _ctx: &ctx::Ctx, _view: View) -> ctx::Result<RawProposal> {
        Err(anyhow::anyhow!("proposal building failed").into())
    }

    fn build_pre_prepare_message(
        &self,
        raw_proposal: RawProposal,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Message {
        self.0
            .build_pre_prepare_message(raw_proposal, certificate, view)
    }

    fn build_prepare_message(&self, proposal_hash: ProposalHash, view: View) -> Message {
        self.0.build_prepare_message(proposal_hash, view)
    }

    fn build_commit_message(&self, proposal_hash: ProposalHash, view: View) -> Message {
        self.0.build_commit_message(proposal_hash, view)
    }

    fn build_round_change_message(
        &self,
        last_prepared_proposal: Option<Proposal>,
        latest_pc: Option<PreparedCertificate>,
        view: View,
    ) -> Message {
        self.0
            .build_round_change_message(last_prepared_proposal, latest_pc, view)
    }

    async fn insert_proposal(
        &self,
        ctx: &ctx::Ctx,
        proposal: Proposal,
        committed_seals: Vec<CommittedSeal>,
    ) -> ctx::Result<()> {
        self.0.insert_proposal(ctx, proposal, committed_seals).await
    }
}

/// Transport that records every multicast on a channel and loops messages
/// back into the attached nodes, the way a gossip layer delivers a node's
/// own broadcasts back to it.
#[derive(Debug)]
pub(crate) struct RecordingTransport {
    nodes: Mutex<Vec<Arc<Ibft>>>,
    sent: ctx::channel::UnboundedSender<Message>,
}

impl RecordingTransport {
    pub(crate) fn new() -> (Arc<Self>, ctx::channel::UnboundedReceiver<Message>) {
        let (send, recv) = ctx::channel::unbounded();
        (
            Arc::new(Self {
                nodes: Mutex::default(),
                sent: send,
            }),
            recv,
        )
    }

    pub(crate) fn attach(&self, node: Arc<Ibft>) {
        self.nodes.lock().unwrap().push(node);
    }
}

impl Transport for RecordingTransport {
    fn multicast(&self, message: Message) {
        self.sent.send(message.clone());
        for node in self.nodes.lock().unwrap().iter() {
            node.add_message(message.clone());
        }
    }
}

/// A single node out of `n` validators, with loopback delivery of its own
/// multicasts. Peer messages are crafted through [`Harness::peer`] and fed
/// in with [`Harness::inject`].
pub(crate) struct Harness {
    pub(crate) node: Arc<Ibft>,
    pub(crate) backend: Arc<TestBackend>,
    pub(crate) sent: ctx::channel::UnboundedReceiver<Message>,
}

impl Harness {
    pub(crate) fn new(n: usize, local: usize) -> Self {
        Self::new_with_base_timeout(n, local, crate::DEFAULT_BASE_ROUND_TIMEOUT)
    }

    pub(crate) fn new_with_base_timeout(
        n: usize,
        local: usize,
        base_round_timeout: time::Duration,
    ) -> Self {
        let backend = Arc::new(TestBackend::new(n, local));
        let (transport, sent) = RecordingTransport::new();
        let node = Arc::new(Ibft::new(Config {
            backend: backend.clone(),
            transport: transport.clone(),
            base_round_timeout,
            additional_timeout: time::Duration::ZERO,
        }));
        transport.attach(node.clone());
        Self {
            node,
            backend,
            sent,
        }
    }

    /// A backend impersonating validator `index`, for crafting peer messages.
    pub(crate) fn peer(&self, index: usize) -> TestBackend {
        TestBackend::new(self.backend.validators.len(), index)
    }

    pub(crate) fn inject(&self, message: Message) {
        self.node.add_message(message);
    }

    /// The next message this node multicast.
    pub(crate) async fn recv_multicast(&mut self, ctx: &ctx::Ctx) -> ctx::OrCanceled<Message> {
        self.sent.recv(ctx).await
    }

    /// A prepared certificate for `raw_proposal` at `view`, proposed by
    /// validator `proposer` and prepared by `preparers`.
    pub(crate) fn prepared_certificate(
        &self,
        raw_proposal: &RawProposal,
        view: View,
        proposer: usize,
        preparers: &[usize],
    ) -> PreparedCertificate {
        PreparedCertificate {
            proposal_message: self.peer(proposer).build_pre_prepare_message(
                raw_proposal.clone(),
                None,
                view,
            ),
            prepare_messages: preparers
                .iter()
                .map(|&i| {
                    self.peer(i)
                        .build_prepare_message(TestBackend::hash(raw_proposal), view)
                })
                .collect(),
        }
    }
}

/// A cluster of `n` nodes wired through a single loopback transport.
/// Returns the nodes, their backends and the shared multicast log.
pub(crate) fn cluster(
    n: usize,
) -> (
    Vec<Arc<Ibft>>,
    Vec<Arc<TestBackend>>,
    ctx::channel::UnboundedReceiver<Message>,
) {
    let (transport, sent) = RecordingTransport::new();
    let backends: Vec<_> = (0..n).map(|i| Arc::new(TestBackend::new(n, i))).collect();
    let nodes: Vec<_> = backends
        .iter()
        .map(|backend| {
            Arc::new(Ibft::new(Config::new(backend.clone(), transport.clone())))
        })
        .collect();
    for node in &nodes {
        transport.attach(node.clone());
    }
    (nodes, backends, sent)
}

/// Polls `pred` until it holds or `ctx` is canceled.
pub(crate) async fn wait_until(
    ctx: &ctx::Ctx,
    mut pred: impl FnMut() -> bool,
) -> ctx::OrCanceled<()> {
    while !pred() {
        ctx.sleep(time::Duration::milliseconds(5)).await?;
    }
    Ok(())
}
