#![no_main]
use libfuzzer_sys::fuzz_target;
use permission_lockstep::perm::{
    DefinitionRegistry, DefinitionSpec, OpEnvelope, PermissionSystem, PlayerId, SystemConfig,
};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic
    let envelope = match OpEnvelope::from_bytes(data) {
        Ok(env) => env,
        Err(_) => return,
    };
    let _ = envelope.decode_op();

    // Applying whatever decodes must never panic either
    let registry = match DefinitionRegistry::new(vec![
        DefinitionSpec::new("build", "Build", true),
        DefinitionSpec::new("fly", "Fly", false),
    ]) {
        Ok(r) => r,
        Err(_) => return,
    };
    let mut system = PermissionSystem::new(registry, SystemConfig::for_player(PlayerId(1)));
    let _ = system.join_player(PlayerId(1), true);
    let before = system.state_hash();
    match system.receive(data) {
        Ok(outcome) if !outcome.is_applied() => {
            assert_eq!(system.state_hash(), before, "Non-applied op changed state");
        }
        Ok(_) => {}
        Err(_) => assert_eq!(system.state_hash(), before, "Corrupt op changed state"),
    }
});
