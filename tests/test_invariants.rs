//! State-machine invariants checked across representative pipeline states.

use std::path::Path;
use std::sync::Arc;

use tilestream::core::heap::INVALID_HEAP_INDEX;
use tilestream::core::loopback::{LoopbackMapping, MemoryStreamer};
use tilestream::core::manifest::{TilesetManifest, MANIFEST_VERSION};
use tilestream::core::mapping_state::Residency;
use tilestream::core::residency::StreamingResource;
use tilestream::{StreamConfig, TileCoord, TileUpdateManager};

struct Rig {
    manager: TileUpdateManager,
    mapping: Arc<LoopbackMapping>,
    resource: Arc<StreamingResource>,
}

fn rig(heap_pages: usize, standard_mips: u32) -> Rig {
    let manifest = TilesetManifest {
        version: MANIFEST_VERSION,
        name: "invariants".to_string(),
        width: 1024,
        height: 1024,
        tile_width: 256,
        tile_height: 256,
        standard_mips,
        packed_tile_count: 0,
        source: None,
    };
    let mapping = Arc::new(LoopbackMapping::new());
    let manager = TileUpdateManager::new_manual(
        StreamConfig { heap_pages, ..Default::default() },
        Arc::clone(&mapping) as Arc<dyn tilestream::MappingBackend>,
        Arc::new(MemoryStreamer::new(heap_pages)) as Arc<dyn tilestream::TileStreamer>,
    )
    .unwrap();
    let resource = manager
        .create_streaming_resource("invariants", &manifest, Path::new("invariants.tiles"))
        .unwrap();
    Rig { manager, mapping, resource }
}

fn feed(rig: &Rig, map: &[u8], fence: u64) {
    rig.resource.queue_feedback(map, fence);
    rig.resource.process_feedback(fence);
}

fn settle(rig: &Rig) {
    for _ in 0..4 {
        rig.manager.uploader().pump();
    }
}

/// Every standard-mip coordinate of a 4x4-finest resource
fn all_coords(standard_mips: u32) -> Vec<TileCoord> {
    let mut coords = Vec::new();
    let (mut w, mut h) = (4u32, 4u32);
    for mip in 0..standard_mips {
        for y in 0..h {
            for x in 0..w {
                coords.push(TileCoord::new(x, y, mip));
            }
        }
        w = (w + 1) / 2;
        h = (h + 1) / 2;
    }
    coords
}

/// Invariant 1: heap_index is valid iff residency is Resident or Loading
fn assert_heap_index_consistency(resource: &StreamingResource, standard_mips: u32) {
    for c in all_coords(standard_mips) {
        let valid = resource.heap_index(c) != INVALID_HEAP_INDEX;
        let backed = matches!(resource.residency(c), Residency::Resident | Residency::Loading);
        assert_eq!(valid, backed, "heap index / residency mismatch at {:?}", c);
    }
}

#[test]
fn heap_index_tracks_residency_through_lifecycle() {
    let rig = rig(16, 4);
    let r = &rig.resource;

    let mut map = vec![4u8; 16];
    map[0] = 0;
    feed(&rig, &map, 1);
    assert_heap_index_consistency(r, 4); // load pending: nothing backed yet

    r.queue_tiles(rig.manager.uploader());
    assert_heap_index_consistency(r, 4); // Loading with pages allocated

    settle(&rig);
    assert_heap_index_consistency(r, 4); // Resident

    map[0] = 4;
    feed(&rig, &map, 2);
    r.next_frame();
    r.next_frame();
    r.queue_tiles(rig.manager.uploader());
    assert_heap_index_consistency(r, 4); // Evicting with pages freed

    settle(&rig);
    assert_heap_index_consistency(r, 4); // NotResident again
}

/// Invariant 2: a resident tile with refcount 0 sits in the eviction ring
#[test]
fn unreferenced_resident_tiles_are_ring_tracked() {
    let rig = rig(16, 1);
    let r = &rig.resource;

    let mut map = vec![1u8; 16];
    map[0] = 0;
    feed(&rig, &map, 1);
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);

    map[0] = 1;
    feed(&rig, &map, 2);

    let c = TileCoord::new(0, 0, 0);
    assert_eq!(r.residency(c), Residency::Resident);
    assert_eq!(r.refcount(c), 0);
    assert!(r.pending_eviction_contains(c));
}

/// Invariant 3: a referenced non-resident tile is pending or on a list
#[test]
fn referenced_nonresident_tiles_are_tracked() {
    let rig = rig(2, 1); // heap pressure keeps part of the request pending
    let r = &rig.resource;

    let mut map = vec![1u8; 16];
    for x in 0..4 {
        map[x] = 0;
    }
    feed(&rig, &map, 1);
    r.queue_tiles(rig.manager.uploader());

    let pending = r.pending_loads();
    for c in all_coords(1) {
        if r.refcount(c) > 0 && r.residency(c) == Residency::NotResident {
            assert!(pending.contains(&c), "{:?} referenced but untracked", c);
        }
    }
    assert_eq!(pending.len(), 2);
    assert_eq!(rig.manager.uploader().in_flight(), 1);
}

/// Invariant 4: no tile is simultaneously a pending load and a pending
/// eviction; refcounts arbitrate
#[test]
fn pending_queues_are_disjoint() {
    let rig = rig(16, 4);
    let r = &rig.resource;

    let mut map = vec![4u8; 16];
    map[0] = 0;
    feed(&rig, &map, 1);
    map[0] = 2;
    feed(&rig, &map, 2);
    map[5] = 1;
    feed(&rig, &map, 3);

    let pending = r.pending_loads();
    for &c in &pending {
        assert!(
            !r.pending_eviction_contains(c),
            "{:?} queued for load and eviction",
            c
        );
    }
}

/// Invariant 5: every published min-mip level has a fully resident chain
#[test]
fn published_min_mip_chain_is_resident() {
    let rig = rig(32, 4);
    let r = &rig.resource;

    let mut map = vec![4u8; 16];
    map[0] = 0;
    map[3] = 1;
    map[10] = 2;
    feed(&rig, &map, 1);
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);
    r.update_min_mip_map();

    let published = rig.manager.resource_min_mip(r);
    for y in 0..4u32 {
        for x in 0..4u32 {
            let m = published[(y * 4 + x) as usize] as u32;
            for mip in m..4 {
                let c = TileCoord::new(x >> mip, y >> mip, mip);
                assert_eq!(
                    r.residency(c),
                    Residency::Resident,
                    "hole in min-mip chain at {:?} (published {})",
                    c,
                    m
                );
            }
        }
    }
}

/// Invariant 6: no unmap is issued before the delay has elapsed
#[test]
fn unmap_respects_eviction_delay() {
    let rig = rig(16, 1); // swap_buffers = 2 -> F = 3
    let r = &rig.resource;
    let c = TileCoord::new(0, 0, 0);

    let mut map = vec![1u8; 16];
    map[0] = 0;
    feed(&rig, &map, 1);
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);
    assert!(rig.mapping.mapped_page(r.handle(), c).is_some());

    map[0] = 1;
    feed(&rig, &map, 2); // frame k: refcount drops

    r.next_frame(); // k + 1
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);
    assert!(rig.mapping.mapped_page(r.handle(), c).is_some(), "unmapped too early");

    r.next_frame(); // k + 2 = k + F - 1
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);
    assert!(rig.mapping.mapped_page(r.handle(), c).is_none());
}

/// Invariant 7: feedback matching the current references is free
#[test]
fn steady_state_feedback_is_free() {
    let rig = rig(16, 4);
    let r = &rig.resource;

    let mut map = vec![4u8; 16];
    map[0] = 1;
    map[7] = 2;
    feed(&rig, &map, 1);
    r.queue_tiles(rig.manager.uploader());
    settle(&rig);

    let free_before = rig.manager.heap().num_free();
    let fences_before = rig.mapping.issued();

    feed(&rig, &map, 2); // identical request

    assert_eq!(r.pending_load_count(), 0);
    assert_eq!(r.pending_eviction_count(), 0);
    r.queue_tiles(rig.manager.uploader());
    assert_eq!(rig.manager.uploader().in_flight(), 0);
    assert_eq!(rig.manager.heap().num_free(), free_before);
    assert_eq!(rig.mapping.issued(), fences_before);
}
