#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use permission_lockstep::perm::{
    DefIndex, DefinitionRegistry, DefinitionSpec, DeleteGroupPayload, DuplicateGroupPayload,
    GroupId, Op, PermissionSystem, PlayerId, RenameGroupPayload, SetFlagPayload,
    SetPlayerGroupPayload, SystemConfig,
};

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Duplicate { name: u8, source: u8 },
    Delete { group: u8, replacement: u8 },
    Rename { group: u8, name: u8 },
    SetPlayerGroup { player: u8, group: u8 },
    SetFlag { group: u8, definition: u8, value: bool },
}

impl FuzzOp {
    fn to_op(&self) -> Op {
        let g = |v: u8| GroupId(u32::from(v % 16));
        let name = |v: u8| format!("G{}", v % 6);
        match *self {
            FuzzOp::Duplicate { name: n, source } => Op::DuplicateGroup(DuplicateGroupPayload {
                name: name(n),
                source: g(source),
            }),
            FuzzOp::Delete { group, replacement } => Op::DeleteGroup(DeleteGroupPayload {
                group: g(group),
                replacement: g(replacement),
            }),
            FuzzOp::Rename { group, name: n } => Op::RenameGroup(RenameGroupPayload {
                group: g(group),
                name: name(n),
            }),
            FuzzOp::SetPlayerGroup { player, group } => {
                Op::SetPlayerGroup(SetPlayerGroupPayload {
                    player: PlayerId(u32::from(player % 5)),
                    group: g(group),
                })
            }
            FuzzOp::SetFlag {
                group,
                definition,
                value,
            } => Op::SetFlag(SetFlagPayload {
                group: g(group),
                definition: DefIndex(u32::from(definition % 3)),
                value,
            }),
        }
    }
}

fn replica(local: u32) -> Option<PermissionSystem> {
    let registry = DefinitionRegistry::new(vec![
        DefinitionSpec::new("build", "Build", true),
        DefinitionSpec::new("fly", "Fly", false),
    ])
    .ok()?;
    let mut system = PermissionSystem::new(registry, SystemConfig::for_player(PlayerId(local)));
    for p in 0..5 {
        system.join_player(PlayerId(p), p % 2 == 0).ok()?;
    }
    Some(system)
}

fuzz_target!(|ops: Vec<FuzzOp>| {
    let (Some(mut a), Some(mut b)) = (replica(0), replica(3)) else {
        return;
    };

    for op in ops.iter().take(256) {
        let bytes = match op.to_op().seal(PlayerId(0)).and_then(|e| e.to_bytes()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let ra = a.receive(&bytes).expect("Well-formed op must decode");
        let rb = b.receive(&bytes).expect("Well-formed op must decode");
        assert_eq!(ra, rb, "Replicas disagreed on {:?}", op);
    }

    assert_eq!(a.state_hash(), b.state_hash(), "Replicas diverged");

    // A joiner caught up from either replica matches both
    let snapshot = a.catch_up_snapshot().expect("Catch-up export must succeed");
    let registry = DefinitionRegistry::new(vec![
        DefinitionSpec::new("build", "Build", true),
        DefinitionSpec::new("fly", "Fly", false),
    ])
    .expect("Static registry is valid");
    let joiner = PermissionSystem::from_catch_up(registry, SystemConfig::default(), &snapshot)
        .expect("Own catch-up snapshot must load");
    assert_eq!(joiner.state_hash(), b.state_hash(), "Joiner diverged");
});
