//! Architecture-specific context switching

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64 as current;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64 as current;
    } else {
        compile_error!("Unsupported architecture");
    }
}

pub use current::SavedRegs;
