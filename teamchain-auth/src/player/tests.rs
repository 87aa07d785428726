// SPDX-License-Identifier: MIT OR Apache-2.0

use serde_json::json;
use teamchain_core::{InviteId, KeyId, LinkType, Seqno};

use crate::invites::InviteError;
use crate::player::{ChainPlayer, ErrorKind, PlayerError, ValidationError};
use crate::policy::PolicyError;
use crate::role::Role;
use crate::state::{ChainState, InviteStatus};
use crate::test_utils::{TestChain, TestKey, TestUser, setup_logging};

fn users() -> (TestUser, TestUser, TestUser, TestUser) {
    (
        TestUser::new(1),
        TestUser::new(2),
        TestUser::new(3),
        TestUser::new(4),
    )
}

/// Chain "acme" owned by alice, with bob as writer.
fn acme(alice: &TestUser, bob: &TestUser) -> TestChain {
    let mut chain = TestChain::new("acme", false);
    chain.root(alice, json!({ "owner": [alice.id()], "writer": [bob.id()] }));
    chain
}

fn replay_until(chain: &TestChain, last: Seqno) -> ChainState {
    let mut y = ChainPlayer::append(None, &chain.unpacked(1), Some(&chain.signer(1))).unwrap();
    for seqno in 2..=last {
        y = ChainPlayer::append(Some(&y), &chain.unpacked(seqno), Some(&chain.signer(seqno)))
            .unwrap();
    }
    y
}

fn cause(err: &PlayerError) -> &ValidationError {
    err.cause().expect("validation error")
}

#[test]
fn root_establishes_group() {
    setup_logging();
    let (alice, bob, _, _) = users();
    let chain = acme(&alice, &bob);

    let y = chain.replay().unwrap();
    assert_eq!(y.id(), chain.id);
    assert_eq!(y.name().to_string(), "acme");
    assert!(!y.is_public());
    assert!(!y.is_subgroup());
    assert_eq!(y.role(&alice.uv), Role::Owner);
    assert_eq!(y.role(&bob.uv), Role::Writer);
    assert_eq!(y.latest_generation(), 1);
    assert_eq!(y.last_seqno(), 1);
    assert_eq!(y.last_high_seqno(), 1);
    assert_eq!(y.members().len(), 2);
}

#[test]
fn root_signer_must_be_owner() {
    let (alice, bob, _, _) = users();
    let mut chain = TestChain::new("acme", false);
    chain.root(&bob, json!({ "owner": [alice.id()], "writer": [bob.id()] }));

    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::RootSignerNotOwner(_)));
    assert_eq!(cause(&err).kind(), ErrorKind::Authorization);
}

#[test]
fn root_requires_owners() {
    let (alice, _, _, _) = users();
    let mut chain = TestChain::new("acme", false);
    chain.root(&alice, json!({ "admin": [alice.id()] }));

    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::RootWithoutOwners));
}

#[test]
fn replay_is_deterministic() {
    let (alice, bob, carol, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [carol.id()] } }),
    );
    chain.link(
        &carol,
        LinkType::Invite,
        json!({ "invites": { "reader": [{ "id": "i1", "name": dave.id(), "type": "keybase" }] } }),
    );
    let key = chain.next_key();
    chain.link_with_key(&bob, LinkType::RotateKey, json!({}), &key);

    let first = chain.replay().unwrap();
    let second = chain.replay().unwrap();
    assert_eq!(first, second);

    let json = serde_json::to_string(&first).unwrap();
    let decoded: ChainState = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, first);
}

#[test]
fn continuity_is_enforced() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    let mut fork = chain.clone();

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );
    fork.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [carol.id()] } }),
    );
    fork.link(&alice, LinkType::Leave, json!({}));

    let y = chain.replay().unwrap();

    // Replaying a link twice.
    let err = ChainPlayer::append(Some(&y), &chain.unpacked(2), Some(&chain.signer(2))).unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::UnexpectedSeqno {
            expected: 3,
            actual: 2
        }
    ));

    // Link of another history.
    let err = ChainPlayer::append(Some(&y), &fork.unpacked(3), Some(&fork.signer(3))).unwrap_err();
    assert!(matches!(cause(&err), ValidationError::PrevMismatch));
    assert_eq!(err.seqno(), Some(3));

    // A chain cannot start in the middle.
    let err = ChainPlayer::append(None, &chain.unpacked(2), Some(&chain.signer(2))).unwrap_err();
    assert!(matches!(cause(&err), ValidationError::UnexpectedSeqno { .. }));
}

#[test]
fn authorization_uses_role_before_the_link() {
    let (alice, bob, carol, dave) = users();
    let mut chain = acme(&alice, &bob);
    let mut fork = chain.clone();

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [carol.id()] } }),
    );
    chain.link(
        &carol,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [dave.id()] } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );

    let y = chain.replay().unwrap();
    assert_eq!(y.role(&dave.uv), Role::Reader);
    assert_eq!(y.role(&carol.uv), Role::Reader);
    assert_eq!(y.role_at(&carol.uv, 3), Role::Admin);
    assert_eq!(y.role_at(&carol.uv, 1), Role::None);
    assert_eq!(y.last_high_seqno(), 4);

    // Demoted admins lose their rights from the next link on.
    chain.link(
        &carol,
        LinkType::ChangeMembership,
        json!({ "members": { "none": [dave.id()] } }),
    );
    let err = chain.replay().unwrap_err();
    assert_eq!(err.seqno(), Some(5));
    assert!(matches!(
        cause(&err),
        ValidationError::InsufficientRole {
            required: Role::Admin,
            actual: Role::Reader,
            ..
        }
    ));

    // A writer cannot promote themselves, not even in the link doing it.
    fork.link(
        &bob,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [bob.id()] } }),
    );
    let err = fork.replay().unwrap_err();
    assert_eq!(cause(&err).kind(), ErrorKind::Authorization);
}

#[test]
fn only_owners_manage_owners() {
    let (alice, bob, carol, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [carol.id()], "owner": [bob.id()] } }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.users_with_role(Role::Owner).len(), 2);

    chain.link(
        &carol,
        LinkType::ChangeMembership,
        json!({ "members": { "owner": [dave.id()] } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::OwnerChangeNotAllowed(uv) if *uv == dave.uv
    ));
}

#[test]
fn membership_sections_are_validated() {
    let (alice, bob, carol, _) = users();
    let carol_reset = TestUser::with_eldest(3, 7);

    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()], "writer": [carol.id()] } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::DuplicateMember(_)));

    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id(), carol_reset.id()] } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::DuplicateUid(_)));
    assert_eq!(cause(&err).kind(), ErrorKind::Structural);
}

#[test]
fn signer_must_match_payload_key() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );
    let y = replay_until(&chain, 1);

    let err = ChainPlayer::append(Some(&y), &chain.unpacked(2), Some(&bob.signer())).unwrap_err();
    assert!(matches!(cause(&err), ValidationError::SignerMismatch { .. }));

    let err = ChainPlayer::append(Some(&y), &chain.unpacked(2), None).unwrap_err();
    assert!(matches!(cause(&err), ValidationError::MissingSigner));
}

#[test]
fn links_must_name_the_group() {
    let (alice, bob, carol, _) = users();
    let other = TestChain::new("other", false);
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "id": other.id, "members": { "reader": [carol.id()] } }),
    );

    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::WrongGroup { .. }));
}

#[test]
fn policy_is_checked_before_transition() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Leave,
        json!({ "members": { "reader": [carol.id()] } }),
    );

    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Policy(PolicyError::UnexpectedSection(_))
    ));
}

#[test]
fn rotate_keys() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    let second = chain.next_key();
    chain.link_with_key(&bob, LinkType::RotateKey, json!({}), &second);

    let base = chain.clone();
    let y = chain.replay().unwrap();
    assert_eq!(y.latest_generation(), 2);
    assert_eq!(y.latest_key().unwrap().signing_kid, second.signing_key.public_key());

    // Publishing a known generation again with the same keys is accepted.
    chain.link_with_key(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
        &second,
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.latest_generation(), 2);
    assert_eq!(y.key(2).unwrap().seqno, 2);

    let mut chain = base.clone();
    chain.link_with_key(&bob, LinkType::RotateKey, json!({}), &TestKey::new(4));
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::InvalidKeyGeneration {
            expected: 3,
            actual: 4
        }
    ));

    let mut chain = base.clone();
    let reused = TestKey {
        generation: 3,
        signing_key: second.signing_key.clone(),
        encryption_kid: KeyId::from_bytes([9; 32]),
    };
    chain.link_with_key(&bob, LinkType::RotateKey, json!({}), &reused);
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::KeyReused(3)));

    let mut chain = base.clone();
    let unsigned = TestKey::new(3);
    chain.link(
        &bob,
        LinkType::RotateKey,
        json!({
            "per_team_key": {
                "generation": 3,
                "encryption_kid": unsigned.encryption_kid,
                "signing_kid": unsigned.signing_key.public_key(),
                "reverse_sig": null,
            }
        }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::MissingReverseSig));

    let mut chain = base;
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );
    chain.link_with_key(&carol, LinkType::RotateKey, json!({}), &TestKey::new(3));
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::InsufficientRole {
            required: Role::Writer,
            ..
        }
    ));
}

#[test]
fn leave_group() {
    let (alice, bob, _, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(&bob, LinkType::Leave, json!({}));
    let y = chain.replay().unwrap();
    assert_eq!(y.role(&bob.uv), Role::None);
    assert!(y.was_member(&bob.uv));

    chain.link(&alice, LinkType::Leave, json!({}));
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::LastOwnerLeaving));
}

#[test]
fn delete_root() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    let mut fork = chain.clone();

    chain.link(&alice, LinkType::DeleteRoot, json!({}));
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        err,
        PlayerError::GroupDeleted { group_id, seqno: 2 } if group_id == chain.id
    ));

    fork.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [carol.id()] } }),
    );
    fork.link(&carol, LinkType::DeleteRoot, json!({}));
    let err = fork.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::InsufficientRole {
            required: Role::Owner,
            ..
        }
    ));
}

#[test]
fn ignorable_unknown_links_only_advance() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.unsupported(&alice, 120);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );

    let y = chain.replay().unwrap();
    assert_eq!(y.last_seqno(), 3);
    assert_eq!(y.role(&carol.uv), Role::Reader);
    assert!(y.link_id(2).is_some());
}

#[test]
fn invites_are_completed() {
    let (alice, bob, _, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [{ "id": "i1", "name": dave.id(), "type": "keybase" }] } }),
    );
    let y = chain.replay().unwrap();
    let id = InviteId::new("i1");
    assert!(y.invites().is_active(&id));
    assert_eq!(y.invites().get(&id).unwrap().role, Role::Reader);

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "reader": [dave.id()] },
            "completed_invites": { "i1": dave.id() },
        }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.invites().status(&id), Some(InviteStatus::Completed { seqno: 3 }));
    assert_eq!(y.role(&dave.uv), Role::Reader);

    // Ids are never reused.
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "writer": [{ "id": "i1", "name": "someone@example.com", "type": "email" }] } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::DuplicateId(_))
    ));
}

#[test]
fn invites_are_cancelled_and_validated() {
    let (alice, bob, _, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "writer": [{ "id": "i1", "name": "a@example.com", "type": "email" }] } }),
    );
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "cancel": ["i1"] } }),
    );
    // Cancelling twice has no further effect.
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "cancel": ["i1"] } }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(
        y.invites().status(&InviteId::new("i1")),
        Some(InviteStatus::Obsolete { seqno: 3 })
    );

    let mut unknown = chain.clone();
    unknown.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "cancel": ["nope"] } }),
    );
    let err = unknown.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::UnknownInvite(_))
    ));

    let mut duplicate = chain.clone();
    duplicate.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [
            { "id": "i2", "name": "b@example.com", "type": "email" },
            { "id": "i3", "name": "b@example.com", "type": "email" },
        ] } }),
    );
    let err = duplicate.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::DuplicateName(_))
    ));

    let mut zero_uses = chain.clone();
    zero_uses.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [
            { "id": "i4", "name": "link", "type": "invitelink", "max_uses": 0 },
        ] } }),
    );
    let err = zero_uses.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::InvalidMaxUses(0))
    ));

    let mut owners = chain;
    owners.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "admin": [bob.id()] } }),
    );
    owners.link(
        &bob,
        LinkType::Invite,
        json!({ "invites": { "owner": [{ "id": "i5", "name": "c@example.com", "type": "email" }] } }),
    );
    let err = owners.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::OwnerInviteNotAllowed(_))
    ));
    assert_eq!(cause(&err).kind(), ErrorKind::Authorization);
}

#[test]
fn multi_use_invites() {
    let (alice, bob, carol, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [
            { "id": "i1", "name": "link", "type": "invitelink", "max_uses": 1 },
        ] } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "reader": [carol.id()] },
            "used_invites": [{ "id": "i1", "uv": carol.id() }],
        }),
    );
    let y = chain.replay().unwrap();
    let id = InviteId::new("i1");
    assert_eq!(y.invites().uses(&id).len(), 1);
    assert!(y.invites().is_active(&id));

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "reader": [dave.id()] },
            "used_invites": [{ "id": "i1", "uv": dave.id() }],
        }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::Exhausted(_))
    ));
}

#[test]
fn membership_obsoletes_invites() {
    let (alice, bob, _, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [{ "id": "i1", "name": dave.id(), "type": "keybase" }] } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "writer": [dave.id()] } }),
    );

    let y = chain.replay().unwrap();
    assert_eq!(
        y.invites().status(&InviteId::new("i1")),
        Some(InviteStatus::Obsolete { seqno: 3 })
    );
}

#[test]
fn implicit_group_additions_consume_invites() {
    let (alice, bob, carol, dave) = users();
    let mut chain = TestChain::implicit(false);
    chain.root(&alice, json!({ "owner": [alice.id(), bob.id()] }));
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "owner": [{ "id": "i1", "name": carol.id(), "type": "keybase" }] } }),
    );
    let base = chain.clone();

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "owner": [carol.id()] },
            "completed_invites": { "i1": carol.id() },
        }),
    );
    let y = chain.replay().unwrap();
    assert!(y.is_implicit());
    assert_eq!(y.role(&carol.uv), Role::Owner);

    let mut uninvited = base.clone();
    uninvited.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "owner": [dave.id()] } }),
    );
    let err = uninvited.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::UninvitedAddition(uv) if *uv == dave.uv
    ));

    let mut readers = base.clone();
    readers.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "writer": [dave.id()] } }),
    );
    let err = readers.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::ImplicitGroupRole(Role::Writer)
    ));

    let mut removal = base;
    removal.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "none": [bob.id()] } }),
    );
    let err = removal.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::UnpairedRemoval(_)));
}

#[test]
fn implicit_group_invites_are_resolved_per_user() {
    let (alice, bob, carol, dave) = users();
    let mut chain = TestChain::implicit(false);
    chain.root(&alice, json!({ "owner": [alice.id(), bob.id()] }));
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "owner": [
            { "id": "i1", "name": carol.id(), "type": "keybase" },
            { "id": "i2", "name": "dave@example.com", "type": "email" },
        ] } }),
    );
    let base = chain.clone();

    // Carol resolves both invites, dave none.
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "owner": [carol.id(), dave.id()] },
            "completed_invites": { "i1": carol.id(), "i2": carol.id() },
        }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::UninvitedAddition(uv) if *uv == dave.uv
    ));

    let mut twice = base.clone();
    twice.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "owner": [carol.id()] },
            "completed_invites": { "i1": carol.id(), "i2": carol.id() },
        }),
    );
    let err = twice.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::UnexpectedInvite(uv) if *uv == carol.uv
    ));

    let mut both = base;
    both.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "owner": [carol.id(), dave.id()] },
            "completed_invites": { "i1": carol.id(), "i2": dave.id() },
        }),
    );
    let y = both.replay().unwrap();
    assert_eq!(y.role(&carol.uv), Role::Owner);
    assert_eq!(y.role(&dave.uv), Role::Owner);
    assert_eq!(
        y.invites().status(&InviteId::new("i2")),
        Some(InviteStatus::Completed { seqno: 3 })
    );
}

#[test]
fn implicit_group_resets() {
    let (alice, bob, _, _) = users();
    let bob_reset = TestUser::with_eldest(2, 5);
    let bob_older = TestUser::with_eldest(2, 0);

    let mut chain = TestChain::implicit(true);
    chain.root(&alice, json!({ "owner": [alice.id(), bob.id()] }));
    let mut backwards = chain.clone();

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "owner": [bob_reset.id()], "none": [bob.id()] } }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.role(&bob.uv), Role::None);
    assert_eq!(y.role(&bob_reset.uv), Role::Owner);
    assert_eq!(y.members_with_uid(&bob.uv.uid), vec![bob_reset.uv]);

    backwards.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "owner": [bob_older.id()], "none": [bob.id()] } }),
    );
    let err = backwards.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::ImplicitReset(_)));
}

#[test]
fn implicit_groups_reject_settings() {
    let (alice, bob, _, _) = users();
    let mut chain = TestChain::implicit(false);
    chain.root(&alice, json!({ "owner": [alice.id(), bob.id()] }));
    chain.link(
        &alice,
        LinkType::Settings,
        json!({ "settings": { "open": { "enabled": true, "join_as": "reader" } } }),
    );

    let err = chain.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Policy(PolicyError::NotAllowedInImplicitGroup(LinkType::Settings))
    ));
}

#[test]
fn open_settings() {
    let (alice, bob, _, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Settings,
        json!({ "settings": { "open": { "enabled": true, "join_as": "writer" } } }),
    );
    let y = chain.replay().unwrap();
    let open = y.open_settings().unwrap();
    assert!(open.open);
    assert_eq!(open.join_as, Role::Writer);
    assert_eq!(open.seqno, 2);

    chain.link(
        &alice,
        LinkType::Settings,
        json!({ "settings": { "open": { "enabled": true, "join_as": "admin" } } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::InvalidJoinAs(role) if role == "admin"));
}

#[test]
fn folder_upgrades() {
    let (alice, bob, _, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &bob,
        LinkType::KbfsUpgrade,
        json!({ "kbfs": { "tlf": { "id": "tlf-1" } } }),
    );
    chain.link(
        &bob,
        LinkType::KbfsUpgrade,
        json!({ "kbfs": { "keyset": {
            "app_type": 1,
            "team_generation": 1,
            "legacy_generation": 3,
            "keyset_hash": "abcd",
        } } }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.tlf_ids().len(), 1);
    assert_eq!(y.tlf_ids()[0].id, "tlf-1");
    assert_eq!(y.legacy_upgrades()[&1][0].legacy_generation, 3);

    let mut unknown = chain.clone();
    unknown.link(
        &bob,
        LinkType::KbfsUpgrade,
        json!({ "kbfs": { "keyset": {
            "app_type": 1,
            "team_generation": 5,
            "legacy_generation": 4,
            "keyset_hash": "abcd",
        } } }),
    );
    let err = unknown.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::UnknownKeyGeneration(5)));

    chain.link(
        &bob,
        LinkType::KbfsUpgrade,
        json!({ "kbfs": { "tlf": { "id": "" } } }),
    );
    let err = chain.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::EmptyTlfId));
}

#[test]
fn bot_settings_follow_role() {
    let (alice, bob, _, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "restricted_bot": [dave.id()] } }),
    );
    chain.link(
        &alice,
        LinkType::BotSettings,
        json!({ "bot_settings": { dave.id(): { "cmds": true, "mentions": false } } }),
    );
    let y = chain.replay().unwrap();
    assert!(y.bot_settings()[&dave.uv].settings.cmds);

    let mut writer = chain.clone();
    writer.link(
        &alice,
        LinkType::BotSettings,
        json!({ "bot_settings": { bob.id(): { "cmds": true } } }),
    );
    let err = writer.replay().unwrap_err();
    assert!(matches!(cause(&err), ValidationError::NotRestrictedBot(uv) if *uv == bob.uv));

    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [dave.id()] } }),
    );
    let y = chain.replay().unwrap();
    assert!(y.bot_settings().is_empty());
}

#[test]
fn stubbed_links() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "writer": [{ "id": "i1", "name": "a@example.com", "type": "email" }] } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );

    let y = chain.replay_stubbed(&[2]).unwrap();
    assert!(y.is_stubbed(2));
    assert!(!y.is_link_fully_present(2));
    assert!(y.is_link_fully_present(3));
    assert_eq!(y.stubbed_links()[&2], LinkType::Invite);
    assert!(y.invites().get(&InviteId::new("i1")).is_none());
    assert_eq!(y.role(&carol.uv), Role::Reader);

    let err = chain.replay_stubbed(&[3]).unwrap_err();
    assert!(matches!(
        err,
        PlayerError::Stubbed {
            seqno: 3,
            link_type: LinkType::ChangeMembership
        }
    ));

    let err = chain.replay_stubbed(&[1]).unwrap_err();
    assert!(matches!(err, PlayerError::FirstLinkStubbed));
}

#[test]
fn invites_in_stubbed_links_are_requested() {
    let (alice, bob, _, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [{ "id": "i1", "name": dave.id(), "type": "keybase" }] } }),
    );
    let base = chain.clone();
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "reader": [dave.id()] },
            "completed_invites": { "i1": dave.id() },
        }),
    );
    assert_eq!(chain.replay().unwrap().last_seqno(), 3);

    let err = chain.replay_stubbed(&[2]).unwrap_err();
    assert!(matches!(
        &err,
        PlayerError::StubbedInvite { seqno: 3, invite, needed }
            if *invite == InviteId::new("i1") && needed == &vec![2]
    ));
    assert_eq!(err.seqno(), Some(3));

    // Supplying the invite first lets the membership change through.
    let y = base.replay_stubbed(&[2]).unwrap();
    let y = base.inflate(&y, 2).unwrap();
    let y = ChainPlayer::append(Some(&y), &chain.unpacked(3), Some(&chain.signer(3))).unwrap();
    assert_eq!(y.role(&dave.uv), Role::Reader);
    assert_eq!(
        y.invites().status(&InviteId::new("i1")),
        Some(InviteStatus::Completed { seqno: 3 })
    );

    // Without stubbed invite links an unknown invite stays a validation error.
    let mut unknown = acme(&alice, &bob);
    unknown.link(
        &alice,
        LinkType::ChangeMembership,
        json!({
            "members": { "reader": [dave.id()] },
            "completed_invites": { "i9": dave.id() },
        }),
    );
    let err = unknown.replay().unwrap_err();
    assert!(matches!(
        cause(&err),
        ValidationError::Invite(InviteError::UnknownInvite(_))
    ));
}

#[test]
fn high_links_are_signed_by_admins() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );
    let y = chain.replay().unwrap();
    assert_eq!(y.last_high_seqno(), 2);
    assert_eq!(y.last_high_link_id(), chain.unpacked(2).link_id);

    // A writer rotating the key does not move the high link.
    let key = chain.next_key();
    chain.link_with_key(&bob, LinkType::RotateKey, json!({}), &key);
    let y = chain.replay().unwrap();
    assert_eq!(y.last_seqno(), 3);
    assert_eq!(y.last_high_seqno(), 2);
}

#[test]
fn inflate_equals_full_replay() {
    let (alice, bob, carol, dave) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "reader": [
            { "id": "i1", "name": dave.id(), "type": "keybase" },
            { "id": "i2", "name": "a@example.com", "type": "email" },
        ] } }),
    );
    chain.link(
        &alice,
        LinkType::Settings,
        json!({ "settings": { "open": { "enabled": true, "join_as": "writer" } } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "writer": [dave.id()], "reader": [carol.id()] } }),
    );
    chain.link(
        &alice,
        LinkType::Settings,
        json!({ "settings": { "open": { "enabled": false } } }),
    );

    let full = chain.replay().unwrap();
    assert_eq!(
        full.invites().status(&InviteId::new("i1")),
        Some(InviteStatus::Obsolete { seqno: 4 })
    );

    let stubbed = chain.replay_stubbed(&[2, 3]).unwrap();
    assert_ne!(stubbed, full);

    let inflated = chain.inflate(&stubbed, 3).unwrap();
    let inflated = chain.inflate(&inflated, 2).unwrap();
    assert_eq!(inflated, full);
    assert_eq!(inflated.open_settings().unwrap().seqno, 5);

    // The other order gives the same result.
    let inflated = chain.inflate(&stubbed, 2).unwrap();
    let inflated = chain.inflate(&inflated, 3).unwrap();
    assert_eq!(inflated, full);
}

#[test]
fn inflate_rejects_wrong_links() {
    let (alice, bob, carol, _) = users();
    let mut chain = acme(&alice, &bob);
    chain.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "writer": [{ "id": "i1", "name": "a@example.com", "type": "email" }] } }),
    );
    chain.link(
        &alice,
        LinkType::ChangeMembership,
        json!({ "members": { "reader": [carol.id()] } }),
    );

    let full = chain.replay().unwrap();
    let err = chain.inflate(&full, 2).unwrap_err();
    assert!(matches!(err, PlayerError::AlreadyInflated { seqno: 2 }));

    let y = replay_until(&chain, 2);
    let err = chain.inflate(&y, 3).unwrap_err();
    assert!(matches!(err, PlayerError::NotInChain { seqno: 3 }));

    let stubbed = chain.replay_stubbed(&[2]).unwrap();
    let mut other = acme(&alice, &bob);
    other.link(
        &alice,
        LinkType::Invite,
        json!({ "invites": { "writer": [{ "id": "i9", "name": "b@example.com", "type": "email" }] } }),
    );
    let err = other.inflate(&stubbed, 2).unwrap_err();
    assert!(matches!(err, PlayerError::InflateMismatch { seqno: 2 }));

    // A failed inflation leaves the prior snapshot usable.
    let inflated = chain.inflate(&stubbed, 2).unwrap();
    assert_eq!(inflated, full);
}
