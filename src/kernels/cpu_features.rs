//! Runtime CPU feature detection for kernel dispatch
//!
//! Detection runs once through raw-cpuid and is cached; the kernel registry
//! registers a vector acceleration mode only when the matching feature is
//! reported here.

use std::fmt;

use once_cell::sync::Lazy;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use raw_cpuid::CpuId;

use super::AccelerationMode;

static CPU_FEATURES: Lazy<CpuFeatures> = Lazy::new(CpuFeatures::detect);

/// CPU architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86,
    Other,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86 => write!(f, "x86"),
            CpuArch::Other => write!(f, "other"),
        }
    }
}

/// SIMD features relevant to the kernel table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    pub sse42: bool,
    pub avx2: bool,
    pub arch: CpuArch,
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuFeatures({}", self.arch)?;
        if self.sse42 {
            write!(f, " +SSE4.2")?;
        }
        if self.avx2 {
            write!(f, " +AVX2")?;
        }
        write!(f, ")")
    }
}

impl CpuFeatures {
    /// Query the processor; prefer [`CpuFeatures::get`]
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            Self::detect_x86()
        }

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            Self::none()
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn detect_x86() -> Self {
        let cpuid = CpuId::new();

        // AVX2 lives in leaf 0x07, SSE4.2 in leaf 0x01
        let avx2 = cpuid
            .get_extended_feature_info()
            .map(|info| info.has_avx2())
            .unwrap_or(false);
        let sse42 = cpuid
            .get_feature_info()
            .map(|info| info.has_sse42())
            .unwrap_or(false);

        Self {
            sse42,
            avx2,
            arch: CpuArch::X86,
        }
    }

    /// Feature set with only the scalar path
    pub fn none() -> Self {
        Self {
            sse42: false,
            avx2: false,
            arch: CpuArch::Other,
        }
    }

    /// Every vector feature reported, for tests and tooling
    pub fn all() -> Self {
        Self {
            sse42: true,
            avx2: true,
            arch: CpuArch::X86,
        }
    }

    /// Cached detection result
    #[inline]
    pub fn get() -> Self {
        *CPU_FEATURES
    }

    /// Acceleration modes this processor can run, slowest first
    pub fn supported_modes(&self) -> Vec<AccelerationMode> {
        let mut modes = vec![AccelerationMode::Generic];
        if self.sse42 {
            modes.push(AccelerationMode::Sse4_2);
        }
        if self.avx2 {
            modes.push(AccelerationMode::Avx2);
        }
        modes
    }
}
