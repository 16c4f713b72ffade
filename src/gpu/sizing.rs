// gpu/sizing.rs — work decomposition for a 1-D dispatch.
//
// A dispatch is `num_groups` workgroups of `local_size` invocations each;
// `global_size = num_groups * local_size` invocations run in total. The
// dispatch primitive only accepts whole groups, so `global_size` is a
// multiple of `local_size` by construction, for every rule.
//
// Whether `global_size` also reaches `dimension = width * height` depends
// on the rule:
//
//   SquaredLocal   num_groups = ceil(dimension / local²)
//                  The reference rule and the default. It launches
//                  `local` times fewer invocations than there are
//                  elements, so it only covers the image if the kernel
//                  processes several elements per invocation (a
//                  grid-stride loop). 1920×1024 with local 64:
//                  480 groups, 30 720 invocations for 1 966 080 elements.
//
//   Covering       num_groups = ceil(dimension / local)
//                  One invocation per element, minimal covering.
//
// Which one the kernel expects is a property of the kernel, not of this
// host, so the rule is a parameter. `WorkDecomposition::covers` makes the
// gap visible and the pipeline reports it before dispatching.

use std::fmt;

use crate::probe::StatusCode;

/// The sizing of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkDecomposition {
    /// Invocations per workgroup.
    pub local_size: u32,
    /// Total invocations (`num_groups * local_size`).
    pub global_size: u64,
    /// Workgroups along x.
    pub num_groups: u32,
}

impl WorkDecomposition {
    /// Whether one invocation per element is available, i.e.
    /// `global_size >= dimension`.
    pub fn covers(&self, dimension: u64) -> bool {
        self.global_size >= dimension
    }

    /// Elements per invocation a kernel must handle to touch everything.
    pub fn elements_per_invocation(&self, dimension: u64) -> u64 {
        if self.global_size == 0 {
            0
        } else {
            dimension.div_ceil(self.global_size)
        }
    }
}

impl fmt::Display for WorkDecomposition {
    /// `global,local, groups`, the sizing line printed before each run.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}, {}", self.global_size, self.local_size, self.num_groups)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("local size must be non-zero")]
    ZeroLocalSize,

    #[error("image is empty (dimension 0)")]
    EmptyDomain,

    #[error("{num_groups} workgroups do not fit a 1-D dispatch")]
    TooManyGroups { num_groups: u64 },
}

impl StatusCode for SizingError {
    fn code(&self) -> i32 {
        match self {
            SizingError::ZeroLocalSize => -40,
            SizingError::EmptyDomain => -41,
            SizingError::TooManyGroups { .. } => -42,
        }
    }
}

/// A rule turning an element count into a dispatch size.
pub trait SizingRule {
    /// Number of workgroups for `dimension` elements.
    fn num_groups(&self, dimension: u64, local_size: u32) -> u64;

    /// Full decomposition. Rejects an empty domain, a zero local size
    /// and group counts that overflow `u32`.
    fn decompose(&self, dimension: u64, local_size: u32) -> Result<WorkDecomposition, SizingError> {
        if local_size == 0 {
            return Err(SizingError::ZeroLocalSize);
        }
        if dimension == 0 {
            return Err(SizingError::EmptyDomain);
        }
        let groups = self.num_groups(dimension, local_size);
        let num_groups =
            u32::try_from(groups).map_err(|_| SizingError::TooManyGroups { num_groups: groups })?;
        Ok(WorkDecomposition {
            local_size,
            global_size: u64::from(num_groups) * u64::from(local_size),
            num_groups,
        })
    }
}

/// `ceil(dimension / local²)` groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredLocal;

impl SizingRule for SquaredLocal {
    fn num_groups(&self, dimension: u64, local_size: u32) -> u64 {
        let l = u64::from(local_size);
        dimension.div_ceil(l * l)
    }
}

/// `ceil(dimension / local)` groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct Covering;

impl SizingRule for Covering {
    fn num_groups(&self, dimension: u64, local_size: u32) -> u64 {
        dimension.div_ceil(u64::from(local_size))
    }
}

/// Named choice of rule, for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sizing {
    /// [`SquaredLocal`].
    #[default]
    SquaredLocal,
    /// [`Covering`].
    Covering,
}

impl SizingRule for Sizing {
    fn num_groups(&self, dimension: u64, local_size: u32) -> u64 {
        match self {
            Sizing::SquaredLocal => SquaredLocal.num_groups(dimension, local_size),
            Sizing::Covering => Covering.num_groups(dimension, local_size),
        }
    }
}

impl fmt::Display for Sizing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sizing::SquaredLocal => write!(f, "squared-local"),
            Sizing::Covering => write!(f, "covering"),
        }
    }
}
