use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn ensure_stack_send_sync() {
    assert_send::<LockFreeStack<u64>>();
    assert_sync::<LockFreeStack<u64>>();
}

fn leak_node(value: u64) -> NonNull<Node<u64>> {
    NonNull::new(Box::into_raw(Box::new(Node::new(value)))).unwrap()
}

/// Reclaim nodes handed out by [leak_node] once they are off the stack.
unsafe fn free_node(node: NonNull<Node<u64>>) {
    drop(Box::from_raw(node.as_ptr()));
}

#[test]
fn tagged_ptr_pack_unpack() {
    let node = leak_node(0);
    let tp = TaggedPtr::pack(node.as_ptr() as *mut (), 0xdead_beef);
    assert_eq!(tp.head(), node.as_ptr() as *mut ());
    assert_eq!(tp.tag(), 0xdead_beef);
    assert_eq!(TaggedPtr::NULL.head(), std::ptr::null_mut());
    assert_eq!(TaggedPtr::NULL.tag(), 0);
    // equality is on both fields
    assert_ne!(tp, TaggedPtr::pack(node.as_ptr() as *mut (), 0xdead_bef0));
    assert_ne!(tp, TaggedPtr::pack(std::ptr::null_mut(), 0xdead_beef));
    unsafe { free_node(node) };
}

#[cfg(not(loom))]
#[test]
fn push_pop_lifo() {
    let stack = LockFreeStack::<u64>::new();
    let n1 = leak_node(1);
    let n2 = leak_node(2);
    let n3 = leak_node(3);
    stack.push(n1);
    stack.push(n2);
    stack.push(n3);

    let p3 = stack.pop().unwrap();
    let p2 = stack.pop().unwrap();
    let p1 = stack.pop().unwrap();
    assert_eq!(p3, n3);
    assert_eq!(p2, n2);
    assert_eq!(p1, n1);
    assert!(stack.pop().is_none());

    unsafe {
        free_node(n1);
        free_node(n2);
        free_node(n3);
    }
}

#[cfg(not(loom))]
#[test]
fn tag_bumps_by_one_on_every_successful_swap() {
    let stack = LockFreeStack::<u64>::new();
    assert_eq!(stack.load().tag(), 0);

    let n1 = leak_node(1);
    let n2 = leak_node(2);
    stack.push(n1);
    assert_eq!(stack.load().tag(), 1);
    stack.push(n2);
    assert_eq!(stack.load().tag(), 2);
    stack.pop().unwrap();
    assert_eq!(stack.load().tag(), 3);
    stack.drain().unwrap();
    assert_eq!(stack.load().tag(), 4);
    // empty drain is a no-op and must not bump the tag
    assert!(stack.drain().is_none());
    assert_eq!(stack.load().tag(), 4);

    unsafe {
        free_node(n1);
        free_node(n2);
    }
}

#[cfg(not(loom))]
#[test]
fn drain_takes_whole_chain_in_order() {
    let stack = LockFreeStack::<u64>::new();
    let nodes: Vec<_> = (0..8).map(leak_node).collect();
    for &n in &nodes {
        stack.push(n);
    }

    let head = stack.drain().unwrap();
    assert!(stack.pop().is_none());

    // pushed 0..8, so the drained chain reads 7..0
    let mut cur = head.as_ptr();
    let mut seen = Vec::new();
    while !cur.is_null() {
        unsafe {
            seen.push((*cur).value);
            cur = (*cur).next.load(Ordering::Relaxed);
        }
    }
    assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1, 0]);

    for n in nodes {
        unsafe { free_node(n) };
    }
}

#[cfg(not(loom))]
#[test]
fn drain_then_push_back_restores_multiset() {
    let stack = LockFreeStack::<u64>::new();
    let nodes: Vec<_> = (0..8).map(leak_node).collect();
    for &n in &nodes {
        stack.push(n);
    }

    // drain, then push the chain back one node at a time
    let head = stack.drain().unwrap();
    let mut cur = head.as_ptr();
    while !cur.is_null() {
        let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
        stack.push(unsafe { NonNull::new_unchecked(cur) });
        cur = next;
    }

    let mut values = Vec::new();
    while let Some(n) = stack.pop() {
        values.push(unsafe { n.as_ref().value });
    }
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<_>>());

    for n in nodes {
        unsafe { free_node(n) };
    }
}

#[cfg(not(loom))]
#[test]
fn push_chain_splices_prebuilt_chain() {
    let stack = LockFreeStack::<u64>::new();
    let below = leak_node(99);
    stack.push(below);

    let nodes: Vec<_> = (0..4).map(leak_node).collect();
    for i in 0..3 {
        unsafe {
            nodes[i]
                .as_ref()
                .next
                .store(nodes[i + 1].as_ptr(), Ordering::Relaxed);
        }
    }
    stack.push_chain(nodes[0], nodes[3]);

    let mut seen = Vec::new();
    while let Some(n) = stack.pop() {
        seen.push(unsafe { n.as_ref().value });
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 99]);

    unsafe { free_node(below) };
    for n in nodes {
        unsafe { free_node(n) };
    }
}

/// ABA stress: P threads hammer pop/push cycles on a shared set of nodes.
/// If a stale CAS ever won, a node would be lost or duplicated and the
/// final drain would not see the exact original set.
#[cfg(not(loom))]
#[test]
fn concurrent_pop_push_loses_nothing() {
    const THREADS: usize = 8;
    const CYCLES: usize = 10_000;
    const NODES: u64 = 16;

    let stack = LockFreeStack::<u64>::new();
    let nodes: Vec<_> = (0..NODES).map(leak_node).collect();
    for &n in &nodes {
        stack.push(n);
    }

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..CYCLES {
                    if let Some(n) = stack.pop() {
                        // hold the node just long enough for rivals to race
                        std::hint::spin_loop();
                        stack.push(n);
                    }
                }
            });
        }
    });

    let mut seen = HashSet::new();
    while let Some(n) = stack.pop() {
        // a duplicated node shows up as a repeated address
        assert!(seen.insert(n.as_ptr() as usize));
    }
    assert_eq!(seen.len(), NODES as usize);
    for &n in &nodes {
        assert!(seen.contains(&(n.as_ptr() as usize)));
    }

    for n in nodes {
        unsafe { free_node(n) };
    }
}

/// Concurrent pushers against one drainer: whatever the drainer takes
/// plus whatever is left on the stack must be exactly what was pushed.
#[cfg(not(loom))]
#[test]
fn concurrent_drain_sees_complete_chains() {
    const PUSHERS: usize = 4;
    const PER_THREAD: u64 = 1_000;

    let stack = LockFreeStack::<u64>::new();
    let mut all_nodes = Vec::new();
    // NonNull is not Send, so hand the pusher threads raw addresses
    let mut per_thread_addrs: Vec<Vec<usize>> = Vec::new();
    for t in 0..PUSHERS as u64 {
        let nodes: Vec<_> = (0..PER_THREAD)
            .map(|i| leak_node(t * PER_THREAD + i))
            .collect();
        per_thread_addrs.push(nodes.iter().map(|n| n.as_ptr() as usize).collect());
        all_nodes.extend(nodes);
    }

    let mut drained: Vec<usize> = Vec::new();
    std::thread::scope(|s| {
        let stack = &stack;
        for addrs in &per_thread_addrs {
            s.spawn(move || {
                for &addr in addrs {
                    stack.push(NonNull::new(addr as *mut Node<u64>).unwrap());
                }
            });
        }
        s.spawn(|| {
            for _ in 0..100 {
                let mut cur = match stack.drain() {
                    Some(head) => head.as_ptr(),
                    None => continue,
                };
                while !cur.is_null() {
                    let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
                    drained.push(cur as usize);
                    cur = next;
                }
            }
        });
    });

    let mut values: Vec<u64> = Vec::new();
    for &addr in &drained {
        values.push(unsafe { (*(addr as *const Node<u64>)).value });
    }
    while let Some(n) = stack.pop() {
        values.push(unsafe { n.as_ref().value });
    }
    values.sort_unstable();
    let expected: Vec<u64> = (0..PUSHERS as u64 * PER_THREAD).collect();
    assert_eq!(values, expected);

    for n in all_nodes {
        unsafe { free_node(n) };
    }
}
