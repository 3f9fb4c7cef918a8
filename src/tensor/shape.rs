//! Named-dimension shapes and layouts.

use std::fmt;

use serde::Serialize;

/// Named tensor dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Dim {
    /// Batch / grouping
    N,
    /// Height (rows, or elements per vector)
    H,
    /// Width (columns, or vectors)
    W,
    /// Depth (filters)
    D,
}

impl Dim {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(Dim::N),
            'H' => Some(Dim::H),
            'W' => Some(Dim::W),
            'D' => Some(Dim::D),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Dim::N => 'N',
            Dim::H => 'H',
            Dim::W => 'W',
            Dim::D => 'D',
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Ordered list of dimensions a tensor is expected to have
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Layout(Vec<Dim>);

impl Layout {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self(dims)
    }

    /// Parse a layout string such as `"HW"`; `None` on unknown or repeated dims
    pub fn parse(s: &str) -> Option<Self> {
        let mut dims = Vec::with_capacity(s.len());
        for c in s.chars() {
            let dim = Dim::from_char(c)?;
            if dims.contains(&dim) {
                return None;
            }
            dims.push(dim);
        }
        Some(Self(dims))
    }

    pub fn h() -> Self {
        Self(vec![Dim::H])
    }

    pub fn hw() -> Self {
        Self(vec![Dim::H, Dim::W])
    }

    pub fn w() -> Self {
        Self(vec![Dim::W])
    }

    pub fn wd() -> Self {
        Self(vec![Dim::W, Dim::D])
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dim in &self.0 {
            write!(f, "{}", dim)?;
        }
        Ok(())
    }
}

/// Ordered mapping from named dimensions to extents
///
/// Dimensions that are not present read as 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Shape {
    dims: Vec<(Dim, u32)>,
}

impl Shape {
    /// Build from `(dim, extent)` pairs; a repeated dim overwrites the earlier extent
    pub fn new(dims: impl IntoIterator<Item = (Dim, u32)>) -> Self {
        let mut shape = Shape::default();
        for (dim, extent) in dims {
            shape.set(dim, extent);
        }
        shape
    }

    pub fn h(h: u32) -> Self {
        Self::new([(Dim::H, h)])
    }

    pub fn w(w: u32) -> Self {
        Self::new([(Dim::W, w)])
    }

    pub fn hw(h: u32, w: u32) -> Self {
        Self::new([(Dim::H, h), (Dim::W, w)])
    }

    pub fn wd(w: u32, d: u32) -> Self {
        Self::new([(Dim::W, w), (Dim::D, d)])
    }

    /// Build from a layout and matching extents; `None` if the lengths differ
    pub fn from_layout(layout: &Layout, extents: &[u32]) -> Option<Self> {
        if layout.rank() != extents.len() {
            return None;
        }
        Some(Self::new(layout.dims().iter().copied().zip(extents.iter().copied())))
    }

    pub fn set(&mut self, dim: Dim, extent: u32) {
        match self.dims.iter_mut().find(|(d, _)| *d == dim) {
            Some(entry) => entry.1 = extent,
            None => self.dims.push((dim, extent)),
        }
    }

    pub fn get(&self, dim: Dim) -> Option<u32> {
        self.dims.iter().find(|(d, _)| *d == dim).map(|(_, e)| *e)
    }

    /// Extent of `dim`, 1 when absent
    pub fn at(&self, dim: Dim) -> u32 {
        self.get(dim).unwrap_or(1)
    }

    pub fn contains(&self, dim: Dim) -> bool {
        self.get(dim).is_some()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.dims.iter().map(|(d, _)| *d).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dim, u32)> + '_ {
        self.dims.iter().copied()
    }

    pub fn volume(&self) -> u64 {
        self.dims.iter().map(|(_, e)| u64::from(*e)).product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (dim, extent)) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", dim, extent)?;
        }
        write!(f, "]")
    }
}
