// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercises against `AccessManager` over `MemoryStore`: a
//! write-then-read round trip, format conversion, 1-bit packing, a corrupt
//! chunk header, a slow backend, and idle-accessor cache cleanup.

use std::sync::Arc;
use std::time::Duration;

use openvds::{
    AccessManager, Axis, Channel, ChannelFlags, ChannelMapping, CompressionMethod, Format,
    LayoutDescriptor, MemoryStore, ObjectStore,
};
use vds_core::{ByteRange, DataBlock, GetResult, ObjectHeaders};

/// Deterministic stand-in for real Simplex noise: a 64-bit hash-combine over
/// the voxel coordinates, folded into `[-1, 1]`. Good enough to exercise
/// round-trip/compression code paths without pulling in a noise crate.
fn pseudo_noise(x: u32, y: u32, z: u32, seed: u64) -> f64 {
    let mut h = seed;
    h ^= x as u64;
    h = vds_utils::rotl64(h.wrapping_mul(0x9E37_79B9_7F4A_7C15), 31);
    h ^= (y as u64).wrapping_add(0x1234_567);
    h = vds_utils::rotl64(h.wrapping_mul(0xBF58_476D_1CE4_E5B9), 27);
    h ^= (z as u64).wrapping_add(0x89AB_CDEF);
    h = vds_utils::rotl64(h.wrapping_mul(0x94D0_49BB_1331_11EB), 17);
    h ^= h >> 33;
    (h as f64 / u64::MAX as f64) * 2.0 - 1.0
}

fn bernoulli(x: u32, y: u32, z: u32, seed: u64, p: f64) -> bool {
    let mut h = seed;
    h ^= x as u64;
    h = vds_utils::rotl64(h.wrapping_mul(0x9E37_79B9_7F4A_7C15), 13);
    h ^= (y as u64).wrapping_add(0x2468_ACE);
    h = vds_utils::rotl64(h.wrapping_mul(0xBF58_476D_1CE4_E5B9), 29);
    h ^= (z as u64).wrapping_add(0x1357_9BDF);
    h ^= h >> 31;
    (h as f64 / u64::MAX as f64) < p
}

fn cube_layout(
    sample_count: u32,
    brick_size: u32,
    margin: u32,
    format: Format,
    value_min: f64,
    value_max: f64,
) -> (LayoutDescriptor, Vec<Axis>, Vec<Channel>) {
    let descriptor = LayoutDescriptor {
        brick_size,
        margin_neg: margin,
        margin_pos: margin,
        max_lod: 0,
        chunk_metadata_page_size: 1024,
        ..Default::default()
    };
    let axes = (0..3)
        .map(|i| Axis {
            name: format!("axis{i}"),
            unit: "m".into(),
            sample_count,
            coordinate_min: 0.0,
            coordinate_max: (sample_count - 1) as f64,
        })
        .collect();
    let channels = vec![Channel {
        name: "Amplitude".into(),
        unit: "".into(),
        format,
        components: 1,
        value_min,
        value_max,
        no_value: None,
        mapping: ChannelMapping::Direct,
        flags: ChannelFlags::empty(),
        integer_scale: 1.0,
        integer_offset: 0.0,
        requested_compression: CompressionMethod::None,
        base_tolerance: 0.0,
    }];
    (descriptor, axes, channels)
}

/// Fills every chunk of the layer's only layer via `f(x, y, z) -> value`,
/// then flushes the write accessor. Writes land at the chunk's interior
/// offset within its (possibly margin-expanded) page block, so this is
/// correct whether or not the layer carries margins.
fn fill_cube(manager: &AccessManager, layer_key: &str, f: impl Fn(u32, u32, u32) -> f64) {
    let cache = manager.open_write_accessor(layer_key).unwrap();
    let indexer = cache.indexer().clone();
    for chunk_index in 0..indexer.total_chunks() {
        let (interior_min, interior_max) = indexer.chunk_min_max_interior(chunk_index);
        let (block_min, _) = indexer.chunk_min_max(chunk_index, true);
        let local_min: Vec<u32> = interior_min.iter().zip(&block_min).map(|(&a, &b)| a - b).collect();
        let size: Vec<u32> = interior_min.iter().zip(&interior_max).map(|(&a, &b)| b - a).collect();
        let local_max: Vec<u32> = local_min.iter().zip(&size).map(|(&a, &b)| a + b).collect();
        let handle = cache.create_page(chunk_index).unwrap();
        let mut values = Vec::with_capacity((size[0] * size[1] * size[2]) as usize);
        for z in 0..size[2] {
            for y in 0..size[1] {
                for x in 0..size[0] {
                    values.push(f(interior_min[0] + x, interior_min[1] + y, interior_min[2] + z));
                }
            }
        }
        cache
            .write_region(
                handle,
                [local_min[0], local_min[1], local_min[2], 0],
                [local_max[0], local_max[1], local_max[2], 1],
                0,
                &values,
            )
            .unwrap();
        cache.release(handle);
    }
    manager.flush().unwrap();
}

fn read_subset(manager: &AccessManager, layer_key: &str, min: &[u32], max: &[u32], format: Format) -> DataBlock {
    let request = manager.request_volume_subset(layer_key, min, max, format, None).unwrap();
    assert!(request.wait_for_completion(Some(Duration::from_secs(5))));
    assert!(request.is_completed());
    let size: Vec<u32> = min.iter().zip(max).map(|(&a, &b)| b - a).collect();
    let mut block = DataBlock::new(format, 1, [size[0], size[1], size[2], 1]);
    block.buffer_mut().copy_from_slice(&request.buffer());
    block
}

#[test]
fn write_then_read_cube_round_trips_through_reopened_store() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(60, 32, 0, Format::F32, -1.0, 1.0);
    let writer = AccessManager::create(store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 345));

    let reader = AccessManager::open(store).unwrap();
    let block = read_subset(&reader, "Dimensions_012LOD0", &[10, 10, 10], &[50, 50, 50], Format::F32);
    for z in 0..40u32 {
        for y in 0..40u32 {
            for x in 0..40u32 {
                let expected = pseudo_noise(10 + x, 10 + y, 10 + z, 345);
                let actual = block.read_element_as_f64([x, y, z, 0], 0);
                assert!((actual - expected).abs() < 1e-5, "mismatch at ({x},{y},{z})");
            }
        }
    }
}

/// Same geometry as above but with nonzero margins, so the requested range
/// `[10,10,10)..[50,50,50)` straddles the brick-32 chunk boundary at voxel 32
/// where adjacent chunks' margin-expanded page blocks overlap. Exercises
/// `PageCache`'s margin copy-on-commit/evict path end to end.
#[test]
fn write_then_read_cube_round_trips_with_nonzero_margins() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(60, 32, 4, Format::F32, -1.0, 1.0);
    let writer = AccessManager::create(store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 901));

    let reader = AccessManager::open(store).unwrap();
    let block = read_subset(&reader, "Dimensions_012LOD0", &[10, 10, 10], &[50, 50, 50], Format::F32);
    for z in 0..40u32 {
        for y in 0..40u32 {
            for x in 0..40u32 {
                let expected = pseudo_noise(10 + x, 10 + y, 10 + z, 901);
                let actual = block.read_element_as_f64([x, y, z, 0], 0);
                assert!((actual - expected).abs() < 1e-5, "mismatch at ({x},{y},{z})");
            }
        }
    }
}

#[test]
fn format_conversion_quantizes_float_to_u8_range() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(60, 32, 0, Format::F32, -1.0, 1.0);
    let writer = AccessManager::create(store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 345));

    let reader = AccessManager::open(store).unwrap();
    let min = [10u32, 10, 10];
    let max = [50u32, 50, 50];
    let as_f32 = read_subset(&reader, "Dimensions_012LOD0", &min, &max, Format::F32);
    let as_u8 = read_subset(&reader, "Dimensions_012LOD0", &min, &max, Format::U8);

    for z in (0..40u32).step_by(5) {
        for y in (0..40u32).step_by(5) {
            for x in (0..40u32).step_by(5) {
                let v = as_f32.read_element_as_f64([x, y, z, 0], 0);
                let expected = ((v - (-1.0)) * 255.0 / (1.0 - (-1.0))).round().clamp(0.0, 255.0);
                let actual = as_u8.read_element_as_f64([x, y, z, 0], 0);
                assert_eq!(actual, expected, "mismatch at ({x},{y},{z})");
            }
        }
    }
}

#[test]
fn one_bit_round_trip_reads_back_as_nonzero_u8() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(20, 16, 0, Format::Bit1, 0.0, 1.0);
    let writer = AccessManager::create(store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| {
        if bernoulli(x, y, z, 123, 0.8) {
            1.0
        } else {
            0.0
        }
    });

    let reader = AccessManager::open(store).unwrap();
    let block = read_subset(&reader, "Dimensions_012LOD0", &[0, 0, 0], &[20, 20, 20], Format::U8);
    for z in 0..20u32 {
        for y in 0..20u32 {
            for x in 0..20u32 {
                let expected_bit = bernoulli(x, y, z, 123, 0.8);
                let byte = block.read_element_as_f64([x, y, z, 0], 0);
                assert_eq!(byte != 0.0, expected_bit, "mismatch at ({x},{y},{z})");
            }
        }
    }
}

#[test]
fn corrupt_chunk_header_cancels_request_and_records_download_error() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(16, 8, 0, Format::F32, -1.0, 1.0);
    let writer = AccessManager::create(store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 7));

    let key = "Dimensions_012LOD0/0";
    let fetched = store.get(key, None).unwrap();
    let mut headers: ObjectHeaders = fetched.headers;
    let (_, header_value) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("vdschunkmetadata"))
        .expect("chunk 0 is not constant-valued, so it must carry a header");
    let mut decoded = base64::decode(&header_value).unwrap();
    decoded[0] ^= 0xFF;
    *header_value = base64::encode(&decoded);
    store.put(key, &fetched.data, headers).unwrap();

    let reader = AccessManager::open(store).unwrap();
    let request = reader
        .request_volume_subset("Dimensions_012LOD0", &[0, 0, 0], &[4, 4, 4], Format::F32, None)
        .unwrap();
    assert!(request.wait_for_completion(Some(Duration::from_secs(5))));
    assert!(request.is_canceled());
    assert!(request.first_error().is_some());
    assert!(reader.current_download_error().is_some());
}

/// Wraps a `MemoryStore` with an artificial per-`get` delay, for exercising
/// `waitForCompletion` timeouts without an external backend.
struct DelayStore {
    inner: MemoryStore,
    delay: Duration,
}

impl ObjectStore for DelayStore {
    fn get(&self, key: &str, range: Option<ByteRange>) -> vds_utils::VdsResult<GetResult> {
        std::thread::sleep(self.delay);
        self.inner.get(key, range)
    }

    fn put(&self, key: &str, data: &[u8], headers: ObjectHeaders) -> vds_utils::VdsResult<()> {
        self.inner.put(key, data, headers)
    }

    fn exists(&self, key: &str) -> vds_utils::VdsResult<bool> {
        self.inner.exists(key)
    }
}

#[test]
fn timeout_returns_false_without_canceling_then_later_completes() {
    let plain_store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(8, 8, 0, Format::F32, -1.0, 1.0);
    let writer = AccessManager::create(plain_store.clone(), descriptor, axes, channels).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 9));

    // `DelayStore` can only wrap a concrete `MemoryStore`, so rebuild one
    // from the same data rather than reusing the `Arc<dyn ObjectStore>`.
    let inner = MemoryStore::new();
    for key in ["VolumeDataLayout", "Dimensions_012LOD0/0"] {
        if let Ok(obj) = plain_store.get(key, None) {
            inner.put(key, &obj.data, obj.headers).unwrap();
        }
    }
    let delayed: Arc<dyn ObjectStore> = Arc::new(DelayStore {
        inner,
        delay: Duration::from_millis(80),
    });

    let reader = AccessManager::open(delayed).unwrap();
    let request = reader
        .request_volume_subset("Dimensions_012LOD0", &[0, 0, 0], &[8, 8, 8], Format::F32, None)
        .unwrap();

    assert!(!request.wait_for_completion(Some(Duration::from_millis(1))));
    assert!(!request.is_canceled());

    assert!(request.wait_for_completion(Some(Duration::from_secs(5))));
    assert!(request.is_completed());
    let mut block = DataBlock::new(Format::F32, 1, [8, 8, 8, 1]);
    block.buffer_mut().copy_from_slice(&request.buffer());
    assert!((block.read_element_as_f64([0, 0, 0, 0], 0) - pseudo_noise(0, 0, 0, 9)).abs() < 1e-5);
}

#[test]
fn idle_accessor_cleanup_zeroes_resident_pages_after_the_cleanup_period() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (descriptor, axes, channels) = cube_layout(16, 8, 0, Format::F32, -1.0, 1.0);
    let writer =
        AccessManager::create_with_idle_cleanup_period(store.clone(), descriptor, axes, channels, Duration::from_secs(3)).unwrap();
    fill_cube(&writer, "Dimensions_012LOD0", |x, y, z| pseudo_noise(x, y, z, 21));

    let reader = AccessManager::open_with_idle_cleanup_period(store, Duration::from_secs(3)).unwrap();
    let request = reader
        .request_volume_traces(
            "Dimensions_012LOD0",
            &[vec![1.0, 1.0, 0.0], vec![2.0, 2.0, 0.0]],
            2,
            16,
            Format::F32,
            None,
        )
        .unwrap();
    assert!(request.wait_for_completion(Some(Duration::from_secs(5))));
    assert!(reader.count_active_pages() > 0);

    std::thread::sleep(Duration::from_secs(4));
    assert_eq!(reader.count_active_pages(), 0);

    let block = read_subset(&reader, "Dimensions_012LOD0", &[0, 0, 0], &[8, 8, 8], Format::F32);
    assert!((block.read_element_as_f64([1, 1, 0, 0], 0) - pseudo_noise(1, 1, 0, 21)).abs() < 1e-5);
}
