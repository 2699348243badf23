#![no_main]
use libfuzzer_sys::fuzz_target;
use permission_lockstep::perm::{
    DefinitionRegistry, DefinitionSpec, ImportExportOptions, ImportMode, PermissionSystem,
    PlayerId, SystemConfig,
};

fn registry() -> Option<DefinitionRegistry> {
    DefinitionRegistry::new(vec![
        DefinitionSpec::new("build", "Build", true),
        DefinitionSpec::new("fly", "Fly", false),
    ])
    .ok()
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let Some(reg) = registry() else { return };

    // First byte picks the mode, the rest is the snapshot
    let mode = if data[0] & 1 == 0 {
        ImportMode::Replace
    } else {
        ImportMode::Merge
    };
    let bytes = &data[1..];

    let mut system = PermissionSystem::new(reg, SystemConfig::for_player(PlayerId(1)));
    let _ = system.join_player(PlayerId(1), true);
    let before = system.state_hash();

    match system.import(bytes, ImportExportOptions::default(), mode) {
        Ok(_) => {
            // Imported state must survive its own export/import
            let exported = system
                .export(ImportExportOptions::default())
                .expect("Export of imported state must succeed");
            let _ = system.finish_import();
            system
                .import(&exported, ImportExportOptions::default(), ImportMode::Replace)
                .expect("Re-import of own export must succeed");
        }
        Err(_) => assert_eq!(system.state_hash(), before, "Rejected import changed state"),
    }

    // Catch-up decoding of arbitrary bytes must not panic
    if let Some(reg) = registry() {
        let _ = PermissionSystem::from_catch_up(reg, SystemConfig::default(), bytes);
    }
});
