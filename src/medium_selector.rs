//! Medium Selector (spec §4.3): picks a writable medium matching size and
//! tag constraints. Grounded on the teacher's pool/volume placement scoring
//! (`control-plane/agents/core/src/pool/service.rs`'s "most free space"
//! candidate scan), adapted to the whole/split two-candidate scheme and the
//! foreign-lock exclusion this spec requires.

use std::collections::BTreeSet;

use crate::dss::{Dss, MediaFilter};
use crate::error::LrsResult;
use crate::model::{MediumRecord, ResourceFamily, ResourceId};

/// Outcome of `select_for_write`.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A usable medium was found.
    Medium(MediumRecord),
    /// Every candidate is currently foreign-locked; the caller should
    /// retry later rather than fail the request.
    Wait,
    /// No combination of media can satisfy `size`.
    NoSpace,
}

/// Picks a medium for a write of `size` bytes among media of `family`
/// carrying all of `tags`, skipping anything in `already_selected` or
/// currently loaded in a busy device.
///
/// `is_device_busy` lets the caller exclude media currently loaded in a
/// device that is serving another request or pending sync (spec §4.3
/// "Exclusions"), without the selector needing to know about devices.
pub fn select_for_write(
    dss: &dyn Dss,
    host: &str,
    family: ResourceFamily,
    size: u64,
    tags: &BTreeSet<String>,
    already_selected: &[ResourceId],
    is_device_busy: impl Fn(&ResourceId) -> bool,
) -> LrsResult<Selection> {
    let filter = MediaFilter {
        id: None,
        family: Some(family),
        admin_status: Some(crate::model::AdminStatus::Unlocked),
        put: Some(true),
        exclude_fs_status: BTreeSet::from([crate::model::FsStatus::Blank, crate::model::FsStatus::Full]),
        tags: tags.clone(),
    };

    let candidates = dss.get_media(&filter)?;

    let mut whole: Option<MediumRecord> = None;
    let mut split: Option<MediumRecord> = None;
    let mut total_free: u64 = 0;

    for medium in candidates {
        if already_selected.contains(&medium.id) || is_device_busy(&medium.id) {
            continue;
        }
        if !medium.is_locked_foreign(host) {
            total_free = total_free.saturating_add(medium.phys_spc_free);
        }

        if medium.phys_spc_free >= size {
            whole = Some(match whole {
                Some(current) if current.phys_spc_free <= medium.phys_spc_free => current,
                _ => medium.clone(),
            });
        }
        split = Some(match split {
            Some(current) if current.phys_spc_free >= medium.phys_spc_free => current,
            _ => medium.clone(),
        });
    }

    if total_free < size {
        return Ok(Selection::NoSpace);
    }

    if let Some(whole) = &whole {
        if !whole.is_locked_foreign(host) {
            return Ok(Selection::Medium(whole.clone()));
        }
    }

    if let Some(split) = split {
        if !split.is_locked_foreign(host) {
            return Ok(Selection::Medium(split));
        }
    }

    Ok(Selection::Wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::memory::MemoryDss;
    use crate::model::{AdminStatus, FsStatus, FsType, LockRecord, ResourceId};

    fn medium(name: &str, free: u64) -> MediumRecord {
        MediumRecord {
            id: ResourceId::new(ResourceFamily::Tape, "lib0", name),
            model: "LTO-8".into(),
            phys_spc_free: free,
            phys_spc_used: 0,
            logical_spc_written: 0,
            obj_count: 0,
            fs_type: FsType::Ltfs,
            fs_status: FsStatus::Used,
            admin_status: AdminStatus::Unlocked,
            get: true,
            put: true,
            tags: BTreeSet::new(),
            lock: None,
        }
    }

    #[test]
    fn whole_fit_preferred_over_split() {
        let dss = MemoryDss::new();
        dss.seed_medium(medium("small-fit", 100));
        dss.seed_medium(medium("big-nofit", 10_000));

        let result = select_for_write(
            &dss,
            "host-a",
            ResourceFamily::Tape,
            100,
            &BTreeSet::new(),
            &[],
            |_| false,
        )
        .unwrap();

        assert_eq!(result, Selection::Medium(medium("small-fit", 100)));
    }

    #[test]
    fn falls_back_to_split_when_no_single_medium_fits() {
        let dss = MemoryDss::new();
        dss.seed_medium(medium("a", 40));
        dss.seed_medium(medium("b", 60));

        let result = select_for_write(
            &dss,
            "host-a",
            ResourceFamily::Tape,
            100,
            &BTreeSet::new(),
            &[],
            |_| false,
        )
        .unwrap();

        assert_eq!(result, Selection::Medium(medium("b", 60)));
    }

    #[test]
    fn reports_no_space_when_total_free_is_short() {
        let dss = MemoryDss::new();
        dss.seed_medium(medium("a", 10));
        dss.seed_medium(medium("b", 10));

        let result = select_for_write(
            &dss,
            "host-a",
            ResourceFamily::Tape,
            100,
            &BTreeSet::new(),
            &[],
            |_| false,
        )
        .unwrap();

        assert_eq!(result, Selection::NoSpace);
    }

    #[test]
    fn waits_when_only_candidate_is_foreign_locked() {
        let dss = MemoryDss::new();
        let mut foreign = medium("a", 1_000);
        foreign.lock = Some(LockRecord::new("other-host", 1));
        dss.seed_medium(foreign);

        let result = select_for_write(
            &dss,
            "host-a",
            ResourceFamily::Tape,
            100,
            &BTreeSet::new(),
            &[],
            |_| false,
        )
        .unwrap();

        assert_eq!(result, Selection::Wait);
    }

    #[test]
    fn excludes_already_selected_media() {
        let dss = MemoryDss::new();
        dss.seed_medium(medium("only", 1_000));
        let id = ResourceId::new(ResourceFamily::Tape, "lib0", "only");

        let result = select_for_write(
            &dss,
            "host-a",
            ResourceFamily::Tape,
            100,
            &BTreeSet::new(),
            &[id],
            |_| false,
        )
        .unwrap();

        assert_eq!(result, Selection::NoSpace);
    }
}
