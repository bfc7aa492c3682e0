use pixel_cache::{
    clone_pixels, floored_divmod, CacheConfig, CacheContext, CacheMode, CacheStore, MaskKind,
    PixelMask, PixelMorphology, Quantum, Region, TierKind, VirtualPixelMethod,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Configurations that force each tier.
fn tier_configs(dir: &TempDir) -> Vec<(TierKind, CacheConfig)> {
    let base = CacheConfig::default().with_temporary_path(dir.path());
    vec![
        (TierKind::Memory, base.clone()),
        (TierKind::MemoryMapped, base.clone().with_memory_mb(0)),
        (TierKind::Disk, base.with_memory_mb(0).with_map_mb(0)),
    ]
}

fn open(config: &CacheConfig, morphology: PixelMorphology) -> CacheStore {
    let mut store = CacheStore::acquire_in(CacheContext::from_config(config), 2);
    store
        .open(morphology, CacheMode::ReadWrite)
        .expect("store should open");
    store
}

fn four_by_four() -> CacheStore {
    let store = open(&CacheConfig::default(), PixelMorphology::new(4, 4, 1));
    let values: Vec<Quantum> = (0..16).collect();
    store
        .write_region(Region::new(0, 0, 4, 4), &values)
        .expect("ramp should be written");
    store
}

#[test]
fn edge_replicates_top_left_corner() {
    let store = four_by_four();
    let pixels = store
        .read_virtual(VirtualPixelMethod::Edge, Region::new(-1, -1, 2, 2))
        .expect("virtual read should succeed");
    assert_eq!(pixels, vec![0, 0, 0, 1]);
}

#[test]
fn tile_repeats_the_image() {
    let store = four_by_four();
    let tiled = store
        .read_virtual(VirtualPixelMethod::Tile, Region::new(4, 0, 4, 4))
        .expect("virtual read should succeed");
    let authentic = store
        .read_authentic(Region::new(0, 0, 4, 4))
        .expect("authentic read should succeed");
    assert_eq!(tiled, authentic);
}

#[test]
fn clone_into_larger_store_zeroes_the_remainder() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    for (_, src_config) in tier_configs(&dir) {
        for (_, dst_config) in tier_configs(&dir) {
            let src = open(&src_config, PixelMorphology::new(2, 2, 1));
            src.write_region(Region::new(0, 0, 2, 2), &[1, 2, 3, 4])
                .expect("source should be written");
            let dst = open(&dst_config, PixelMorphology::new(4, 4, 1));
            dst.write_region(Region::new(0, 0, 4, 4), &[9; 16])
                .expect("destination should be written");

            clone_pixels(&dst, &src).expect("clone should succeed");

            assert_eq!(
                dst.read_authentic(Region::new(0, 0, 2, 2)).unwrap(),
                vec![1, 2, 3, 4]
            );
            assert_eq!(dst.read_authentic(Region::new(2, 2, 2, 2)).unwrap(), vec![0; 4]);
            assert_eq!(dst.read_authentic(Region::new(2, 0, 2, 1)).unwrap(), vec![0; 2]);
        }
    }
}

#[test]
fn round_trip_on_every_tier_and_path() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let mut rng = StdRng::seed_from_u64(7);
    let regions = [
        // Whole rows.
        Region::new(0, 2, 9, 3),
        // Single partial row.
        Region::row(3, 6, 4),
        // Interior block, always staged.
        Region::new(2, 1, 5, 4),
        Region::new(8, 7, 1, 1),
    ];
    for (kind, config) in tier_configs(&dir) {
        let store = open(&config, PixelMorphology::new(9, 8, 3));
        assert_eq!(store.tier(), kind);
        for region in regions {
            let count = (region.width * region.height * 3) as usize;
            let values: Vec<Quantum> = (0..count).map(|_| rng.gen()).collect();
            store
                .write_region(region, &values)
                .expect("region should be written");
            assert_eq!(
                store.read_authentic(region).expect("region should be read"),
                values,
                "{} {}",
                kind,
                region
            );
        }
    }
}

#[test]
fn clone_is_tier_transparent() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let morphology = PixelMorphology::new(7, 5, 2).with_metacontent(3);
    let mut rng = StdRng::seed_from_u64(11);
    let values: Vec<Quantum> = (0..70).map(|_| rng.gen()).collect();
    let whole = Region::new(0, 0, 7, 5);

    let reference = {
        let src = open(&CacheConfig::default(), morphology.clone());
        src.write_region(whole, &values).unwrap();
        let dst = open(&CacheConfig::default(), morphology.clone());
        clone_pixels(&dst, &src).unwrap();
        dst.read_authentic(whole).unwrap()
    };

    for (src_kind, src_config) in tier_configs(&dir) {
        let src = open(&src_config, morphology.clone());
        src.write_region(whole, &values).unwrap();
        for (dst_kind, dst_config) in tier_configs(&dir) {
            let dst = open(&dst_config, morphology.clone());
            clone_pixels(&dst, &src).expect("clone should succeed");
            assert_eq!(
                dst.read_authentic(whole).unwrap(),
                reference,
                "{} => {}",
                src_kind,
                dst_kind
            );
        }
    }
}

#[test]
fn mirror_resolves_reflections_to_the_same_pixel() {
    let store = open(&CacheConfig::default(), PixelMorphology::new(5, 1, 1));
    store.write_region(Region::row(0, 0, 5), &[10, 11, 12, 13, 14]).unwrap();
    for coord in -12i64..12 {
        for k in -2i64..=2 {
            let reflected = 2 * k * 5 - coord - 1;
            let a = store
                .read_virtual(VirtualPixelMethod::Mirror, Region::row(coord, 0, 1))
                .unwrap();
            let b = store
                .read_virtual(VirtualPixelMethod::Mirror, Region::row(reflected, 0, 1))
                .unwrap();
            assert_eq!(a, b, "{} vs {}", coord, reflected);
        }
    }
}

#[test]
fn floored_divmod_law_holds() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..1000 {
        let v: i64 = rng.gen_range(-1_000_000..1_000_000);
        let extent: u64 = rng.gen_range(1..5000);
        let m = floored_divmod(v, extent);
        assert!(m.remainder >= 0 && (m.remainder as u64) < extent);
        assert_eq!(v, m.quotient * extent as i64 + m.remainder);
    }
}

#[test]
fn virtual_reads_far_outside_the_image() {
    let store = four_by_four();
    let checker = store
        .read_virtual(VirtualPixelMethod::CheckerTile, Region::row(0, 4, 8))
        .unwrap();
    // Tile (0, 1) of the checkerboard is constant, tile (1, 1) repeats the image.
    assert_eq!(&checker[..4], &[Quantum::MAX; 4]);
    assert_eq!(&checker[4..], &[0, 1, 2, 3]);

    let horizontal = store
        .read_virtual(VirtualPixelMethod::HorizontalTile, Region::new(-2, -1, 1, 2))
        .unwrap();
    assert_eq!(horizontal, vec![Quantum::MAX, 2]);

    let transparent = store
        .read_virtual(VirtualPixelMethod::Transparent, Region::row(-100, -100, 2))
        .unwrap();
    assert_eq!(transparent, vec![0, 0]);
}

#[test]
fn random_policy_is_reproducible_with_a_seed() {
    let mut store = four_by_four();
    store.set_random_seed(42);
    let first = store
        .read_virtual(VirtualPixelMethod::Random, Region::row(-8, -8, 8))
        .unwrap();
    store.set_random_seed(42);
    let second = store
        .read_virtual(VirtualPixelMethod::Random, Region::row(-8, -8, 8))
        .unwrap();
    assert_eq!(first, second);
    assert!(first.iter().all(|v| *v < 16));
}

#[test]
fn composite_mask_blends_on_sync() {
    let mut store = open(&CacheConfig::default(), PixelMorphology::new(2, 1, 1));
    store.write_region(Region::row(0, 0, 2), &[1000, 1000]).unwrap();
    store.set_mask(Some(PixelMask::new(MaskKind::Composite, 2, vec![0.5, 1.0])));
    store.write_region(Region::row(0, 0, 2), &[3000, 3000]).unwrap();
    assert_eq!(store.read_authentic(Region::row(0, 0, 2)).unwrap(), vec![2000, 3000]);
}

#[test]
fn store_method_is_used_for_virtual_pixels() {
    let mut store = four_by_four();
    store
        .set_virtual_pixel_method(VirtualPixelMethod::White)
        .expect("method should be set");
    let mut nexus = store.nexus(1).expect("slot 1 should exist");
    let pixels = nexus
        .get_virtual_pixels(Region::row(3, 3, 2))
        .expect("virtual read should succeed");
    assert_eq!(pixels, &[15, Quantum::MAX]);
}
