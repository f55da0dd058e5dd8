//! Diagnostic dump of heap contents.
//!
//! Walks a heap's block list under its lock and writes one line per item
//! to a caller-supplied sink. No allocation happens while dumping, so the
//! sink may be backed by a fixed buffer or a raw console.

use core::fmt::{self, Write};
use core::sync::atomic::Ordering;

use crate::{
    heap::RegionHeap,
    item::{HEADER_SIZE, ItemHeader},
    registry,
};

/// Writes the layout of one heap: a summary line followed by every item
/// in address order with its payload address, size and state.
///
/// A corrupt header stops the walk with a marker line instead of
/// panicking, so the dump stays usable for post-mortem inspection. A
/// detached heap produces a single marker line.
pub fn dump_heap<W: Write>(heap: &RegionHeap, out: &mut W) -> fmt::Result {
    let Ok(_guard) = heap.lock.acquire() else {
        return writeln!(out, "[memheap] <detached heap>");
    };
    let state = heap.state.get();
    unsafe {
        let pool_size = heap.pool_size.load(Ordering::Relaxed);
        let start = (*state).start;
        writeln!(
            out,
            "[{}] {:p} - {:p}",
            (*state).name,
            start,
            start.add(pool_size),
        )?;
        writeln!(
            out,
            "  pool {pool_size}, available {}, max used {}",
            heap.available.load(Ordering::Relaxed),
            heap.max_used.load(Ordering::Relaxed),
        )?;

        let end = start.addr() + pool_size - HEADER_SIZE;
        let mut item = (*state).block_list;
        while item.addr() < end {
            if !ItemHeader::magic_ok(item) {
                writeln!(out, "  {item:p}: corrupt header, magic {:#010x}", (*item).magic)?;
                break;
            }
            let payload = ItemHeader::payload(item);
            let size = ItemHeader::payload_size(item);
            if ItemHeader::is_used(item) {
                write!(out, "  {payload:p}: {size:>8} used")?;
                #[cfg(feature = "owner-tag")]
                write_tag(item, out)?;
                writeln!(out)?;
            } else {
                writeln!(out, "  {payload:p}: {size:>8} free")?;
            }
            item = (*item).next;
        }
    }
    Ok(())
}

/// Dumps every registered heap, in registration order.
pub fn dump_all<W: Write>(out: &mut W) -> fmt::Result {
    for heap in registry::heaps() {
        dump_heap(heap, out)?;
    }
    Ok(())
}

#[cfg(feature = "owner-tag")]
unsafe fn write_tag<W: Write>(item: *const ItemHeader, out: &mut W) -> fmt::Result {
    let mut tag = [0_u8; crate::item::TAG_CAPACITY];
    unsafe { ItemHeader::read_tag(item, &mut tag) };
    out.write_char(' ')?;
    for byte in tag {
        out.write_char(if byte.is_ascii_graphic() || byte == b' ' {
            byte as char
        } else {
            '.'
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use super::*;
    use crate::heap::free;

    fn with_heap<F: FnOnce(&'static RegionHeap)>(name: &'static str, f: F) {
        let layout = Layout::from_size_align(2048, 16).unwrap();
        let pool = unsafe { std::alloc::alloc(layout) };
        let heap: &'static RegionHeap = Box::leak(Box::new(RegionHeap::new()));
        unsafe { heap.init(name, pool, 2048).unwrap() };
        f(heap);
        heap.detach();
        unsafe { std::alloc::dealloc(pool, layout) };
    }

    #[test]
    fn dump_lists_used_and_free_items() {
        with_heap("dumped", |heap| {
            let ptr = heap.allocate(64).unwrap();

            let mut out = String::new();
            dump_heap(heap, &mut out).unwrap();

            assert!(out.contains("[dumped]"), "missing heap banner: {out}");
            assert!(out.contains("used"), "missing used item: {out}");
            assert!(out.contains("free"), "missing free item: {out}");
            assert!(out.contains("64"), "missing payload size: {out}");

            unsafe { free(ptr) };
        });
    }

    #[test]
    fn dump_all_covers_registered_heaps() {
        with_heap("alpha", |_first| {
            with_heap("beta", |_second| {
                let mut out = String::new();
                dump_all(&mut out).unwrap();
                assert!(out.contains("[alpha]"));
                assert!(out.contains("[beta]"));
            });
        });
    }

    #[cfg(feature = "owner-tag")]
    #[test]
    fn dump_shows_owner_tags() {
        with_heap("tagged", |heap| {
            let ptr = heap.allocate(64).unwrap();
            unsafe { crate::heap::set_owner_tag(ptr, "rxqueue") };

            let mut out = String::new();
            dump_heap(heap, &mut out).unwrap();
            assert!(out.contains("rxqueue"), "tag not shown: {out}");

            unsafe { free(ptr) };
        });
    }
}
