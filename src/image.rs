// image.rs — Dense row-major image container, generic over element type.
//
// The device side sees an image as one flat storage buffer of
// `width * height` elements, so unlike a display image this container
// never carries row padding: stride == width, always. That keeps the
// host and device representations byte-identical and lets upload and
// read-back be a single `bytemuck::cast_slice` each way.
//
// SHAPE INVARIANT
// ───────────────
//   data.len() == width * height
//
// Every constructor enforces this, and nothing hands out the backing
// `Vec`, so the invariant holds for the whole lifetime of the value.

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Trait for element types that can live in an [`Image`] and travel to
/// the device unchanged.
///
/// `bytemuck::Pod` is what makes the GPU transfer a plain byte copy.
/// `FromStr` + `Display` are what the CSV store uses to read and write
/// values.
pub trait Pixel:
    bytemuck::Pod + Default + PartialEq + FromStr + fmt::Display + fmt::Debug + Send + Sync + 'static
{
    /// Parse one CSV token. Surrounding whitespace is ignored.
    /// Returns `None` when the token is not a valid value of this type.
    fn parse_token(token: &str) -> Option<Self> {
        token.trim().parse().ok()
    }
}

impl Pixel for i32 {}
impl Pixel for u32 {}
impl Pixel for f32 {}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D matrix of `T` with runtime dimensions, stored row-major.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// Create a zero-initialised image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
        }
    }

    /// Wrap an existing row-major vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of elements (`width * height`).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the pixel data in bytes. This is also the size of the
    /// device buffer paired with this image.
    #[inline]
    pub fn byte_len(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<T>()) as u64
    }

    /// Get the value at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Borrow row `y` as a slice of exactly `width` elements.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over rows, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        // chunks_exact(0) panics; a zero-width image has no data to chunk.
        self.data.chunks_exact(self.width.max(1))
    }

    /// Overwrite every element with `T::default()` (zero for numeric types).
    pub fn clear(&mut self) {
        self.data.fill(T::default());
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Raw bytes in device layout.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// Debug formatting — prints the top-left corner only, large images are
// the common case.
impl<T: Pixel> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        write!(f, "}}")
    }
}
