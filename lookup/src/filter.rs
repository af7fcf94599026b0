use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr};

use crate::lpm::{LPM_VALUE_INVALID, Lpm};

/// One classification rule handed to the compiler.
///
/// `net_start..=net_end` is an inclusive destination range (only the
/// first `key_len` bytes are significant); `port == None` means the rule
/// matches any destination port (pure-L3 services).
#[derive(Clone)]
pub struct FilterRule {
    pub net_start: [u8; 16],
    pub net_end: [u8; 16],
    pub port: Option<u16>,
    pub proto: u8,
    pub action: u32,
}

#[repr(C)]
struct ClassHdr {
    offset: u32,
    len: u32,
}

#[repr(C)]
struct CompiledRule {
    port: u16,
    any_port: u8,
    proto: u8,
    action: u32,
}

/// Compiled `(net, port, proto) -> action` lookup table.
///
/// Compilation groups rules by identical network range into classes,
/// paints each class id into an LPM over the destination address, and
/// lays the per-class `(port, proto)` match lists out in two flat arrays.
/// Query cost is one LPM walk plus a short ordered scan; the first
/// matching rule wins. Ranges painted later shadow earlier ones where
/// they overlap, so compilers emit broader rules first.
#[repr(C)]
pub struct Filter {
    lpm: Lpm,
    mctx: RelPtr<MemoryContext>,
    key_len: u32,
    class_count: u32,
    classes: RelPtr<ClassHdr>,
    rules: RelPtr<CompiledRule>,
    rule_count: u32,
}

/// Build `filter` in place from `rules`. `key_len` is 4 or 16.
pub fn compile_filter(
    filter: &mut Filter,
    mctx: *mut MemoryContext,
    key_len: usize,
    rules: &[FilterRule],
) -> MemResult {
    filter.mctx = RelPtr::null();
    filter.mctx.store(mctx);
    filter.key_len = key_len as u32;
    filter.lpm.init(mctx)?;

    // Group rules by identical range, preserving submission order inside
    // each group.
    let mut groups: Vec<(([u8; 16], [u8; 16]), Vec<&FilterRule>)> = Vec::new();
    for rule in rules {
        let range = (rule.net_start, rule.net_end);
        match groups.iter_mut().find(|(key, _)| *key == range) {
            Some((_, members)) => members.push(rule),
            None => groups.push((range, vec![rule])),
        }
    }

    filter.class_count = groups.len() as u32;
    filter.rule_count = rules.len() as u32;

    let classes_bytes = groups.len() * size_of::<ClassHdr>();
    let rules_bytes = rules.len() * size_of::<CompiledRule>();
    // SAFETY: live single-writer context.
    let classes = unsafe { (*mctx).balloc_zeroed(classes_bytes.max(1)) } as *mut ClassHdr;
    let compiled = unsafe { (*mctx).balloc_zeroed(rules_bytes.max(1)) } as *mut CompiledRule;
    if classes.is_null() || compiled.is_null() {
        return Err(MemError::OutOfMemory);
    }
    filter.classes = RelPtr::null();
    filter.classes.store(classes);
    filter.rules = RelPtr::null();
    filter.rules.store(compiled);

    let mut cursor = 0u32;
    for (class_idx, ((start, end), members)) in groups.iter().enumerate() {
        // SAFETY: `class_idx` is within the freshly allocated array.
        unsafe {
            (*classes.add(class_idx)).offset = cursor;
            (*classes.add(class_idx)).len = members.len() as u32;
        }
        for rule in members {
            // SAFETY: `cursor` stays below `rules.len()`.
            unsafe {
                *compiled.add(cursor as usize) = CompiledRule {
                    port: rule.port.unwrap_or(0),
                    any_port: rule.port.is_none() as u8,
                    proto: rule.proto,
                    action: rule.action,
                };
            }
            cursor += 1;
        }
        filter
            .lpm
            .insert(&start[..key_len], &end[..key_len], class_idx as u32)?;
    }
    Ok(())
}

impl Filter {
    /// Match `(dst, port, proto)`; returns the first matching action.
    pub fn query(&self, dst: &[u8], port: u16, proto: u8) -> Option<u32> {
        let class = self.lpm.lookup(&dst[..self.key_len as usize]);
        if class == LPM_VALUE_INVALID {
            return None;
        }
        // SAFETY: class ids painted into the LPM are indices into the
        // classes array; rule spans were laid out by the compiler.
        unsafe {
            let hdr = self.classes.load().add(class as usize);
            let rules = self.rules.load().add((*hdr).offset as usize);
            for idx in 0..(*hdr).len as usize {
                let rule = rules.add(idx);
                if ((*rule).any_port != 0 || (*rule).port == port) && (*rule).proto == proto {
                    return Some((*rule).action);
                }
            }
        }
        None
    }

    pub fn free(&mut self) {
        self.lpm.free();
        let mctx = self.mctx.load();
        if mctx.is_null() {
            return;
        }
        let classes = self.classes.load();
        let rules = self.rules.load();
        // SAFETY: sizes mirror the compile-time allocations.
        unsafe {
            if !classes.is_null() {
                let bytes = (self.class_count as usize * size_of::<ClassHdr>()).max(1);
                (*mctx).bfree(classes as *mut u8, bytes);
            }
            if !rules.is_null() {
                let bytes = (self.rule_count as usize * size_of::<CompiledRule>()).max(1);
                (*mctx).bfree(rules as *mut u8, bytes);
            }
        }
        self.classes = RelPtr::null();
        self.rules = RelPtr::null();
    }
}
