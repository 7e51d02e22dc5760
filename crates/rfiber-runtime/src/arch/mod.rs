//! Architecture-specific context switching
//!
//! Each architecture provides `SavedContext`, `init_context` and
//! `switch_context(from, to)`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, SavedContext};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, SavedContext};
    } else {
        compile_error!("rfiber supports x86_64 and aarch64 only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PingPong {
        main: SavedContext,
        fiber: SavedContext,
        hits: u32,
    }

    unsafe extern "C" fn ping(arg: usize) {
        let pp = arg as *mut PingPong;
        loop {
            (*pp).hits += 1;
            switch_context(&mut (*pp).fiber, &(*pp).main);
        }
    }

    #[test]
    fn test_switch_back_and_forth() {
        let mut stack = vec![0u8; 64 * 1024];
        let mut pp = Box::new(PingPong {
            main: SavedContext::default(),
            fiber: SavedContext::default(),
            hits: 0,
        });
        let raw: *mut PingPong = &mut *pp;

        unsafe {
            let top = stack.as_mut_ptr().add(stack.len());
            init_context(&mut (*raw).fiber, top, ping, raw as usize);
            for expected in 1..=3 {
                switch_context(&mut (*raw).main, &(*raw).fiber);
                assert_eq!((*raw).hits, expected);
            }
        }
    }
}
