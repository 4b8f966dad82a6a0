mod common;

use common::{Machine, pa, va};
use kernel_paging::{
    CachingMode, ClientPageSpace, PageFlags, PageSpace, PagingConfig, TagSlot, PAGE_SIZE,
};
use std::sync::Arc;

const USER: u64 = 0x0000_4000_0000;

fn spaces(m: &Machine, n: usize) -> Vec<ClientPageSpace> {
    (0..n)
        .map(|i| {
            let s = m.client();
            s.map_single_4k(
                va(USER),
                pa(0x8000_0000 + i as u64 * PAGE_SIZE),
                PageFlags::READ,
                CachingMode::WriteBack,
            )
            .unwrap();
            s
        })
        .collect()
}

#[test]
fn least_recently_primary_binding_is_evicted() {
    let m = Machine::new();
    let s = spaces(&m, 10);
    let mut cpu = m.cpu(0);
    for space in &s[..8] {
        PageSpace::activate(space.space(), &mut cpu);
    }
    assert!(cpu.bindings().iter().all(|b| b.is_bound()));

    PageSpace::activate(s[8].space(), &mut cpu);
    assert_eq!(s[0].space().num_bindings(), 0);
    assert_eq!(cpu.find_binding(s[8].space()), Some(0));
    assert_eq!(
        cpu.tlb().last_load(),
        Some((s[8].space().root_table(), TagSlot::new(0), true))
    );

    // s[1] becomes recent again; s[2] is now the oldest
    PageSpace::activate(s[1].space(), &mut cpu);
    PageSpace::activate(s[9].space(), &mut cpu);
    assert_eq!(s[2].space().num_bindings(), 0);
    assert_eq!(s[1].space().num_bindings(), 1);
    assert_eq!(cpu.find_binding(s[9].space()), Some(2));
}

#[test]
fn current_binding_keeps_its_tag_contents() {
    let m = Machine::new();
    let s = spaces(&m, 2);
    let mut cpu = m.cpu(0);
    PageSpace::activate(s[0].space(), &mut cpu);
    PageSpace::activate(s[1].space(), &mut cpu);
    PageSpace::activate(s[0].space(), &mut cpu);

    assert_eq!(
        cpu.tlb().last_load(),
        Some((s[0].space().root_table(), TagSlot::new(0), false))
    );
    assert_eq!(cpu.primary(), Some(0));
    assert!(Arc::ptr_eq(cpu.primary_space().unwrap(), s[0].space()));

    // reactivating the primary space does not reload
    let loads = cpu.tlb().loads.len();
    PageSpace::activate(s[0].space(), &mut cpu);
    assert_eq!(cpu.tlb().loads.len(), loads);
}

#[test]
fn translations_never_leak_between_spaces() {
    let m = Machine::new();
    let s = spaces(&m, 12);
    let mut cpu = m.cpu(0);

    // a fixed but irregular walk over more spaces than there are tags
    for step in 0..200usize {
        let i = (step * 5 + step / 7) % s.len();
        PageSpace::activate(s[i].space(), &mut cpu);
        assert_eq!(
            cpu.tlb_mut().read(va(USER)),
            Some(pa(0x8000_0000 + i as u64 * PAGE_SIZE)),
            "space {i} saw a foreign translation"
        );
    }
    assert!(cpu.tlb().violations.is_empty(), "{:?}", cpu.tlb().violations);
    assert!(cpu.bindings().iter().filter(|b| b.is_bound()).count() <= 8);
}

#[test]
fn single_slot_evicts_on_every_switch() {
    let m = Machine::new();
    let s = spaces(&m, 2);
    let config = PagingConfig::new(1, 16).unwrap();
    let mut cpu = m.cpu_with(0, &config);

    PageSpace::activate(s[0].space(), &mut cpu);
    PageSpace::activate(s[1].space(), &mut cpu);
    assert_eq!(s[0].space().num_bindings(), 0);
    assert_eq!(s[1].space().num_bindings(), 1);

    PageSpace::activate(s[0].space(), &mut cpu);
    assert!(cpu.tlb().loads.iter().all(|&(_, tag, flush)| tag == TagSlot::new(0) && flush));
    assert_eq!(cpu.tlb_mut().read(va(USER)), Some(pa(0x8000_0000)));
}

#[test]
fn unbinding_a_background_slot_releases_the_space() {
    let m = Machine::new();
    let s = spaces(&m, 2);
    let mut cpu = m.cpu(0);
    PageSpace::activate(s[0].space(), &mut cpu);
    PageSpace::activate(s[1].space(), &mut cpu);

    cpu.unbind(0);
    assert_eq!(s[0].space().num_bindings(), 0);
    assert!(!cpu.bindings()[0].is_bound());
    assert_eq!(cpu.bindings()[0].primary_stamp(), 0);

    // the freed slot is reused, with a flush
    PageSpace::activate(s[0].space(), &mut cpu);
    assert_eq!(cpu.find_binding(s[0].space()), Some(0));
    assert!(cpu.tlb().last_load().is_some_and(|(_, _, flush)| flush));
}

#[test]
#[should_panic(expected = "cannot unbind the primary binding")]
fn unbinding_the_primary_slot_is_fatal() {
    let m = Machine::new();
    let s = spaces(&m, 1);
    let mut cpu = m.cpu(0);
    PageSpace::activate(s[0].space(), &mut cpu);
    cpu.unbind(0);
}

#[test]
fn every_cpu_binds_the_kernel_space_once() {
    let m = Machine::new();
    let cpus: Vec<_> = (0..4).map(|id| m.cpu(id)).collect();
    assert!(cpus.iter().all(|c| c.global_binding().is_bound()));
    assert_eq!(m.kernel.space().num_bindings(), 4);
}
