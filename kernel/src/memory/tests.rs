//! Memory self tests: frame allocator, page walker, heap and DMA arena.
//!
//! Run from the post-boot test pass, against the real allocators.

use alloc::vec;

use crate::iommu;
use crate::pci;

use super::io_paging;
use super::iovmm::{DmaCaching, DmaDirection, Iovmm, Region};
use super::paging;
use super::pmm::{self, FrameAllocator, Region as PmmRegion};
use super::walker::PageFlags;
use super::{heap, PhysAddr, VirtAddr, PAGE_SIZE};

/// A synthetic 256 MiB map: after setup the frames the bitmap occupies
/// must never be handed out, and the first allocation is the first frame
/// past them.
fn test_pmm_bootstrap() {
    let base = 0x10_0000u64;
    let len = 0x1000_0000u64;
    let regions = [PmmRegion { base, len }];

    let bitmap_bytes = (((base + len) / PAGE_SIZE + 7) / 8) as usize;
    let storage = vec![0u8; bitmap_bytes].leak();

    let mut allocator = FrameAllocator::with_storage(&regions, storage);

    // Mirror init: the bitmap itself lives in the first frames of the
    // region and is reserved back.
    let bitmap_frames = (bitmap_bytes as u64 + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..bitmap_frames {
        allocator.reserve_block(PhysAddr::new(base + i * PAGE_SIZE));
    }

    let first = allocator.alloc_block().unwrap();
    assert_eq!(first.as_u64(), base + bitmap_frames * PAGE_SIZE);

    // Distinct until freed.
    let second = allocator.alloc_block().unwrap();
    assert_ne!(first, second);

    // A freed frame may come back.
    allocator.free_block(first);
    let third = allocator.alloc_block().unwrap();
    assert_eq!(third, first);

    // Contiguous runs are aligned and actually contiguous.
    let run = allocator.alloc_n_blocks(8).unwrap();
    assert!(run.is_aligned(PAGE_SIZE));
    let stats = allocator.stats();
    assert!(stats.free_frames > 0);

    log::info!("memory tests: pmm bootstrap ok");
}

/// Map, translate, protect, unmap on a scratch CPU context, and verify
/// teardown returns every table frame to the allocator.
fn test_walker_roundtrip() {
    let before = pmm::stats();

    {
        let mut ctx = paging::new_address_space();

        let pa = PhysAddr::new(0x20_0000);
        let va = VirtAddr::new(0xFFFF_FF00_0000_0000);

        ctx.map(pa, va, PageFlags::PRESENT | PageFlags::WRITE);
        assert_eq!(ctx.get_phys(va).as_u64(), pa.as_u64());
        assert_eq!(ctx.get_phys(va + 0x123).as_u64(), pa.as_u64() + 0x123);

        // protect touches permissions only.
        ctx.protect(va, PageFlags::PRESENT);
        assert_eq!(ctx.get_phys(va).as_u64(), pa.as_u64());
        let flags = ctx.get_flags(va).unwrap();
        assert!(flags.contains(PageFlags::PRESENT));
        assert!(!flags.contains(PageFlags::WRITE));

        assert_eq!(ctx.unmap(va), pa);
        assert!(ctx.get_phys(va).is_null());

        // Unmapping something never mapped is a null, not an error.
        assert!(ctx.unmap(VirtAddr::new(0xFFFF_FF00_1000_0000)).is_null());
    }

    let after = pmm::stats();
    assert_eq!(
        before.free_frames, after.free_frames,
        "context teardown leaked table frames"
    );

    log::info!("memory tests: walker roundtrip ok");
}

fn test_heap_small() {
    let p1 = heap::alloc(32, 16);
    let p2 = heap::alloc(32, 16);

    assert!(!p1.is_null() && !p2.is_null());
    assert_ne!(p1, p2);
    assert!(p1.is_aligned(16) && p2.is_aligned(16));
    assert_eq!(heap::is_slab_backed(p1), Some(true));

    // Adjacent cells when both came from the same slab.
    let delta = p1.as_u64().abs_diff(p2.as_u64());
    if p1.as_u64() / PAGE_SIZE == p2.as_u64() / PAGE_SIZE {
        assert_eq!(delta, 32);
    }

    heap::free(p2);
    heap::free(p1);

    // The freed cell is back on the slab's list.
    let p3 = heap::alloc(32, 16);
    assert!(!p3.is_null());
    heap::free(p3);

    log::info!("memory tests: heap small ok");
}

fn test_heap_large() {
    let p = heap::alloc(8192, 16);
    assert!(!p.is_null());
    assert!(p.is_aligned(PAGE_SIZE));
    assert_eq!(heap::is_slab_backed(p), Some(false));

    heap::free(p);

    let q = heap::alloc(8192, 16);
    assert!(!q.is_null());
    assert!(q.is_aligned(PAGE_SIZE));
    heap::free(q);

    log::info!("memory tests: heap large ok");
}

fn test_iovmm() {
    // A fake device slot with an AMD-style context behind it.
    let device = pci::Address::new(0, 0x7F, 0x1F, 7);
    if !iommu::is_registered(device) {
        iommu::register_device(
            device,
            iommu::DeviceContext::AmdVi(io_paging::new_context(4)),
        );
    }

    let mut arena = Iovmm::new(device);
    arena.push_region(Region {
        base: 0x1000,
        len: 0xFFFF_F000,
    });

    let allocation = arena
        .alloc(0x4000, DmaDirection::Bidirectional, DmaCaching::Uncacheable)
        .unwrap();
    assert_eq!(allocation.guest_base, 0x1000);
    assert_eq!(allocation.len, 0x4000);
    assert!(!allocation.host_base.is_null());

    // The device-side mapping resolves to the host backing.
    let host_pa = paging::kernel_space().lock().get_phys(allocation.host_base);
    assert_eq!(iommu::get_phys(device, allocation.guest_base), host_pa);

    arena.free(allocation);
    assert_eq!(
        arena.regions(),
        &[Region {
            base: 0x1000,
            len: 0xFFFF_F000,
        }]
    );

    log::info!("memory tests: iovmm ok");
}

pub fn run() {
    test_pmm_bootstrap();
    test_walker_roundtrip();
    test_heap_small();
    test_heap_large();
    test_iovmm();
}
