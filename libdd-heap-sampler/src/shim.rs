// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Global allocator shim feeding the sampler.

use std::alloc::{GlobalAlloc, Layout};

use crate::sampler::{hook_layer_active, AllocationSampler, AllocatorType};

/// Wraps any [`GlobalAlloc`] and reports every allocation and free to the
/// process-wide [`AllocationSampler`]. Install it as the global allocator:
///
/// ```ignore
/// use std::alloc::System;
/// use libdd_heap_sampler::SamplingAllocator;
///
/// #[global_allocator]
/// static ALLOC: SamplingAllocator<System> = SamplingAllocator::new(System);
/// ```
///
/// Until the hook layer is activated by the first observer registration the
/// shim forwards to the inner allocator with no sampler calls at all, so the
/// sampler singleton is never constructed from inside an allocation.
pub struct SamplingAllocator<A> {
    inner: A,
}

impl<A> SamplingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if hook_layer_active() {
            AllocationSampler::get().record_alloc(
                ptr as usize,
                layout.size(),
                AllocatorType::GlobalShim,
                None,
            );
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if hook_layer_active() {
            AllocationSampler::get().record_alloc(
                ptr as usize,
                layout.size(),
                AllocatorType::GlobalShim,
                None,
            );
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Report before the memory is returned; once freed the address can
        // be handed out again by a concurrent allocation.
        if hook_layer_active() {
            AllocationSampler::get().record_free(ptr as usize);
        }
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if hook_layer_active() {
            AllocationSampler::get().record_free(ptr as usize);
        }
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if hook_layer_active() {
            AllocationSampler::get().record_alloc(
                new_ptr as usize,
                new_size,
                AllocatorType::GlobalShim,
                None,
            );
        }
        new_ptr
    }
}
