use quickcheck_macros::quickcheck;
use std::{cell::Cell, rc::Rc};

use super::{BinaryHeap, BinaryHeapCtx};

#[quickcheck]
fn heap_sort(values: Vec<u32>) {
    let mut heap: Vec<u32> = Vec::new();
    for &x in &values {
        heap.heap_push(x, ());
    }

    let mut sorted = values;
    sorted.sort_unstable();

    let mut popped = Vec::new();
    while let Some(x) = heap.heap_pop(()) {
        popped.push(x);
    }

    assert_eq!(popped, sorted);
}

/// An element that records its current heap position through a shared cell.
#[derive(Clone)]
struct Tracked(u32, Rc<Cell<usize>>);

struct TrackedCtx;

impl BinaryHeapCtx<Tracked> for TrackedCtx {
    fn lt(&mut self, x: &Tracked, y: &Tracked) -> bool {
        x.0 < y.0
    }

    fn on_move(&mut self, e: &mut Tracked, new_index: usize) {
        e.1.set(new_index);
    }
}

#[quickcheck]
fn position_tracking(values: Vec<u32>, removal_seed: Vec<u8>) {
    let mut heap: Vec<Tracked> = Vec::new();
    let mut cells = Vec::new();

    for &x in &values {
        let cell = Rc::new(Cell::new(usize::MAX));
        cells.push((x, Rc::clone(&cell)));
        let i = heap.heap_push(Tracked(x, cell), TrackedCtx);
        assert_eq!(cells.last().unwrap().1.get(), i);
    }

    // Each element's recorded position must point back at itself
    let check = |heap: &Vec<Tracked>| {
        for (i, e) in heap.iter().enumerate() {
            assert_eq!(e.1.get(), i);
        }
    };
    check(&heap);

    // Remove elements at pseudo-random positions
    for &s in &removal_seed {
        if heap.is_empty() {
            break;
        }
        let i = s as usize % heap.len();
        let removed = heap.heap_remove(i, TrackedCtx).unwrap();
        removed.1.set(usize::MAX);
        check(&heap);

        // What remains must still be a min-heap
        for (i, e) in heap.iter().enumerate() {
            if i > 0 {
                assert!(heap[(i - 1) / 2].0 <= e.0);
            }
        }
    }
}
