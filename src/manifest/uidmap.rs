//! Host uid ranges for target nsgroups.
use super::types::{needs_idmap, IdmapSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeDefaults {
    pub start: u64,
    pub range: u64,
}

pub const FULL_RANGE: RangeDefaults = RangeDefaults {
    start: 100_000,
    range: 65_536,
};

/// For containers which themselves only have 65536 ids to hand out.
pub const TINY_RANGE: RangeDefaults = RangeDefaults {
    start: 40_000,
    range: 2_000,
};

pub const UID_MAP: &str = "/proc/self/uid_map";

/// Whether a `uid_map` maps the whole host uid space.
pub fn uidmap_is_host(uid_map: &str) -> bool {
    uid_map.split_whitespace().collect::<Vec<_>>() == ["0", "0", "4294967295"]
}

pub fn range_defaults_from(uid_map: &Path) -> RangeDefaults {
    match std::fs::read_to_string(uid_map) {
        Ok(text) if uidmap_is_host(&text) => FULL_RANGE,
        _ => TINY_RANGE,
    }
}

pub fn range_defaults() -> RangeDefaults {
    range_defaults_from(Path::new(UID_MAP))
}

/// The next host id base after every allocation in `uidmaps`.
pub fn first_unused(uidmaps: &[IdmapSet], defaults: RangeDefaults) -> u64 {
    uidmaps
        .iter()
        .map(|u| u.id + defaults.range)
        .max()
        .map_or(defaults.start, |next| next.max(defaults.start))
}

/// Make sure `nsgroup` has a range in `uidmaps`, reusing its allocation from
/// `old` if it had one.
pub fn add_uidmap(old: &[IdmapSet], uidmaps: &mut Vec<IdmapSet>, nsgroup: &str, defaults: RangeDefaults) {
    if !needs_idmap(nsgroup) || uidmaps.iter().any(|u| u.name == nsgroup) {
        return;
    }
    if let Some(prev) = old.iter().find(|u| u.name == nsgroup) {
        uidmaps.push(prev.clone());
        return;
    }
    // stay clear of ranges still held in the old manifest
    let id = first_unused(uidmaps, defaults).max(first_unused(old, defaults));
    uidmaps.push(IdmapSet {
        name: nsgroup.to_string(),
        id,
        range: defaults.range,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn set(name: &str, id: u64) -> IdmapSet {
        IdmapSet {
            name: name.into(),
            id,
            range: FULL_RANGE.range,
        }
    }

    #[test]
    fn host_uid_map() -> Result<()> {
        assert!(uidmap_is_host("         0          0 4294967295\n"));
        assert!(!uidmap_is_host("0 100000 65536\n"));
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("uid_map");
        std::fs::write(&path, "0 0 4294967295\n")?;
        assert_eq!(range_defaults_from(&path), FULL_RANGE);
        std::fs::write(&path, "0 1000 1\n")?;
        assert_eq!(range_defaults_from(&path), TINY_RANGE);
        assert_eq!(range_defaults_from(&tmp.path().join("none")), TINY_RANGE);
        Ok(())
    }

    #[test]
    fn allocation() {
        let mut maps = vec![];
        add_uidmap(&[], &mut maps, "none", FULL_RANGE);
        add_uidmap(&[], &mut maps, "", FULL_RANGE);
        assert!(maps.is_empty());

        add_uidmap(&[], &mut maps, "a", FULL_RANGE);
        add_uidmap(&[], &mut maps, "b", FULL_RANGE);
        add_uidmap(&[], &mut maps, "a", FULL_RANGE);
        assert_eq!(maps, vec![set("a", 100_000), set("b", 165_536)]);
    }

    #[test]
    fn reuses_previous_ranges() {
        let old = vec![set("a", 100_000), set("b", 165_536)];
        let mut maps = vec![];
        add_uidmap(&old, &mut maps, "b", FULL_RANGE);
        add_uidmap(&old, &mut maps, "c", FULL_RANGE);
        assert_eq!(maps, vec![set("b", 165_536), set("c", 231_072)]);
    }
}
