// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities.
//!
//! [`TestChain`] writes real, signed links: ed25519 envelopes over CBOR outer links, blake3
//! payload hashes and reverse signatures for every published per-group key.
use rand::RngCore;
use serde_json::{Value, json};
use teamchain_core::payload::sign_reverse;
use teamchain_core::{
    GroupId, GroupName, Hash, KeyId, LinkId, LinkType, OuterLink, PrivateKey, RawLink, SeqType,
    Seqno, SignedEnvelope, UnpackedLink, UserId, UserVersion, unpack_link,
};

use crate::player::{ChainPlayer, PlayerError, Signer};
use crate::state::ChainState;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// A user with a deterministic uid and sigchain key.
#[derive(Clone, Debug)]
pub struct TestUser {
    pub uv: UserVersion,
    pub private_key: PrivateKey,
}

impl TestUser {
    pub fn new(seed: u8) -> Self {
        Self::with_eldest(seed, 1)
    }

    /// Same uid as [`TestUser::new`], at another account incarnation.
    pub fn with_eldest(seed: u8, eldest_seqno: Seqno) -> Self {
        let mut key_seed = [seed; 32];
        key_seed[0] = eldest_seqno as u8;
        Self {
            uv: UserVersion::new(UserId::from_bytes([seed; 16]), eldest_seqno),
            private_key: PrivateKey::from_bytes(&key_seed),
        }
    }

    /// Textual user version, as used in membership sections.
    pub fn id(&self) -> String {
        self.uv.to_string()
    }

    pub fn signer(&self) -> Signer {
        Signer::new(self.uv)
    }
}

/// Per-group key about to be published.
#[derive(Clone, Debug)]
pub struct TestKey {
    pub generation: u64,
    pub signing_key: PrivateKey,
    pub encryption_kid: KeyId,
}

impl TestKey {
    pub fn new(generation: u64) -> Self {
        let mut encryption_kid = [0; 32];
        rand::thread_rng().fill_bytes(&mut encryption_kid);
        Self {
            generation,
            signing_key: PrivateKey::new(),
            encryption_kid: KeyId::from_bytes(encryption_kid),
        }
    }

    fn section(&self) -> Value {
        json!({
            "generation": self.generation,
            "encryption_kid": self.encryption_kid,
            "signing_kid": self.signing_key.public_key(),
            "reverse_sig": null,
        })
    }
}

/// Builder for the chain of one group.
#[derive(Clone, Debug)]
pub struct TestChain {
    pub id: GroupId,
    pub name: GroupName,
    pub public: bool,
    pub implicit: bool,
    pub parent_id: Option<GroupId>,
    links: Vec<(RawLink, Signer)>,
    last_link_id: Option<LinkId>,
    merkle_seqno: u64,
    generation: u64,
}

impl TestChain {
    /// Root group with a regular name.
    pub fn new(name: &str, public: bool) -> Self {
        let name: GroupName = name.parse().expect("valid group name");
        let id = name.to_root_group_id(public).expect("root group name");
        Self::with_identity(id, name, public, false, None)
    }

    /// Implicit group, named after its members.
    pub fn implicit(public: bool) -> Self {
        let mut display_hash = [0; 16];
        rand::thread_rng().fill_bytes(&mut display_hash);
        let mut id = [0; 16];
        rand::thread_rng().fill_bytes(&mut id);
        id[15] = if public { 0x2e } else { 0x24 };
        let id = GroupId::from_bytes(id).expect("root suffix");
        Self::with_identity(id, GroupName::implicit(&display_hash), public, true, None)
    }

    /// Sub-group of `parent` with the given last name part.
    pub fn subgroup(parent: &TestChain, part: &str) -> Self {
        let mut seed = [0; 15];
        rand::thread_rng().fill_bytes(&mut seed);
        let name = parent.name.child(part).expect("valid name part");
        let id = GroupId::new_subgroup(seed, parent.public);
        Self::with_identity(id, name, parent.public, false, Some(parent.id))
    }

    fn with_identity(
        id: GroupId,
        name: GroupName,
        public: bool,
        implicit: bool,
        parent_id: Option<GroupId>,
    ) -> Self {
        Self {
            id,
            name,
            public,
            implicit,
            parent_id,
            links: Vec::new(),
            last_link_id: None,
            merkle_seqno: 100,
            generation: 0,
        }
    }

    pub fn last_seqno(&self) -> Seqno {
        self.links.len() as Seqno
    }

    /// Next per-group key generation.
    pub fn next_key(&self) -> TestKey {
        TestKey::new(self.generation + 1)
    }

    /// Write the root link, naming the group and publishing key generation 1.
    pub fn root(&mut self, owner: &TestUser, members: Value) -> RawLink {
        let team = json!({
            "name": self.name.to_string(),
            "public": self.public,
            "implicit": self.implicit,
            "members": members,
        });
        let key = self.next_key();
        self.link_with_key(owner, LinkType::Root, team, &key)
    }

    /// Write the head link of a sub-group, pointing at the parent link which created it.
    pub fn head(&mut self, admin: &TestUser, parent_seqno: Seqno) -> RawLink {
        let parent_id = self.parent_id.expect("sub-group chain");
        let team = json!({
            "name": self.name.to_string(),
            "public": self.public,
            "parent": { "id": parent_id, "seqno": parent_seqno },
            "admin": { "group_id": parent_id, "seqno": 1 },
        });
        let key = self.next_key();
        let raw = self.link_with_key(admin, LinkType::SubgroupHead, team, &key);
        self.mark_implicit_admin(1);
        raw
    }

    /// Write a link carrying the given team section. The group id is filled in.
    pub fn link(&mut self, author: &TestUser, link_type: LinkType, team: Value) -> RawLink {
        self.write(author, link_type, team, None)
    }

    /// Write a link of a type unknown to this implementation, marked as safe to ignore.
    pub fn unsupported(&mut self, author: &TestUser, code: u64) -> RawLink {
        self.write(author, LinkType::Unsupported(code), json!({}), None)
    }

    /// Write a link publishing a new per-group key.
    pub fn link_with_key(
        &mut self,
        author: &TestUser,
        link_type: LinkType,
        team: Value,
        key: &TestKey,
    ) -> RawLink {
        let raw = self.write(author, link_type, team, Some(key));
        self.generation = self.generation.max(key.generation);
        raw
    }

    fn write(
        &mut self,
        author: &TestUser,
        link_type: LinkType,
        mut team: Value,
        key: Option<&TestKey>,
    ) -> RawLink {
        let seqno = self.last_seqno() + 1;
        if team.get("id").is_none() {
            team["id"] = json!(self.id);
        }
        if let Some(key) = key {
            team["per_team_key"] = key.section();
        }

        let mut payload = json!({
            "body": {
                "type": link_type.as_str().unwrap_or("team.unsupported"),
                "version": 2,
                "key": { "uid": author.uv.uid, "kid": author.private_key.public_key().key_id() },
                "merkle_root": { "seqno": self.merkle_seqno },
                "team": team,
            },
            "ctime": 1_700_000_000 + seqno,
            "prev": self.last_link_id,
            "seqno": seqno,
            "tag": "signature",
        });
        if let Some(key) = key {
            sign_reverse(&mut payload, &key.signing_key).expect("payload with key section");
        }
        let payload = payload.to_string();

        let outer = OuterLink {
            version: 2,
            seqno,
            prev: self.last_link_id,
            payload_hash: Hash::new(payload.as_bytes()),
            link_type: link_type.code(),
            seq_type: SeqType::for_group(self.public),
            ignore_if_unsupported: matches!(link_type, LinkType::Unsupported(_)),
        };
        let envelope = SignedEnvelope::sign(&outer, &author.private_key).expect("encode outer");
        let raw = RawLink {
            seqno,
            sig: envelope.to_hex().expect("encode envelope"),
            payload: Some(payload),
            uid: author.uv.uid,
            version: 2,
        };

        self.last_link_id = Some(envelope.link_id());
        self.merkle_seqno += 1;
        self.links.push((raw.clone(), author.signer()));
        raw
    }

    /// Accept the signer of the link at `seqno` as admin of an ancestor group.
    pub fn mark_implicit_admin(&mut self, seqno: Seqno) {
        if let Some((_, signer)) = self.links.get_mut(seqno as usize - 1) {
            signer.implicit_admin = true;
        }
    }

    pub fn raw(&self, seqno: Seqno) -> RawLink {
        self.links[seqno as usize - 1].0.clone()
    }

    pub fn raw_links(&self) -> Vec<RawLink> {
        self.links.iter().map(|(raw, _)| raw.clone()).collect()
    }

    pub fn signer(&self, seqno: Seqno) -> Signer {
        self.links[seqno as usize - 1].1
    }

    pub fn unpacked(&self, seqno: Seqno) -> UnpackedLink {
        unpack_link(self.raw(seqno)).expect("valid link")
    }

    /// Replay all links in order.
    pub fn replay(&self) -> Result<ChainState, PlayerError> {
        self.replay_stubbed(&[])
    }

    /// Replay all links in order, withholding the payloads of `stubbed`.
    pub fn replay_stubbed(&self, stubbed: &[Seqno]) -> Result<ChainState, PlayerError> {
        let mut state: Option<ChainState> = None;
        for (index, (raw, signer)) in self.links.iter().enumerate() {
            let seqno = index as Seqno + 1;
            let link = if stubbed.contains(&seqno) {
                unpack_link(raw.to_stub()).expect("valid link")
            } else {
                unpack_link(raw.clone()).expect("valid link")
            };
            let signer = (!link.is_stubbed()).then_some(signer);
            state = Some(ChainPlayer::append(state.as_ref(), &link, signer)?);
        }
        Ok(state.expect("chain has links"))
    }

    /// Supply the payload of a stubbed link.
    pub fn inflate(&self, state: &ChainState, seqno: Seqno) -> Result<ChainState, PlayerError> {
        ChainPlayer::inflate(state, &self.unpacked(seqno), &self.links[seqno as usize - 1].1)
    }
}
