use bytemuck::Pod;

/// An element type that can be filtered and sorted on the GPU.
///
/// Kernels are written against a placeholder element type which is replaced by the WGSL text
/// given here before composition. The key is a `u32` read from the element; it is what
/// predicates compare and what the radix sort orders by.
///
/// The host layout of `Self` must match the WGSL array stride of [`Self::WGSL_TYPE`]. This is
/// checked when the kernels are compiled.
///
/// # Example
///
/// ```rust
/// use wgbufops::GpuElement;
///
/// #[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
/// #[repr(C)]
/// struct Particle {
///     cell: u32,
///     id: u32,
///     mass: f32,
///     radius: f32,
/// }
///
/// impl GpuElement for Particle {
///     const WGSL_TYPE: &'static str = "Particle";
///     const WGSL_DECL: &'static str =
///         "struct Particle { cell: u32, id: u32, mass: f32, radius: f32 }";
///     const WGSL_KEY: &'static str = "elt.cell";
///
///     fn key(&self) -> u32 {
///         self.cell
///     }
/// }
/// ```
pub trait GpuElement: Pod {
    /// The WGSL type of one element.
    const WGSL_TYPE: &'static str;
    /// WGSL declarations needed by [`Self::WGSL_TYPE`] (typically a struct definition).
    const WGSL_DECL: &'static str = "";
    /// A WGSL expression computing the `u32` key of the element named `elt`.
    const WGSL_KEY: &'static str;

    /// The key of this element, as computed by [`Self::WGSL_KEY`] on the GPU.
    fn key(&self) -> u32;
}

impl GpuElement for u32 {
    const WGSL_TYPE: &'static str = "u32";
    const WGSL_KEY: &'static str = "elt";

    fn key(&self) -> u32 {
        *self
    }
}

/// A key (`x`) with a payload (`y`).
impl GpuElement for [u32; 2] {
    const WGSL_TYPE: &'static str = "vec2<u32>";
    const WGSL_KEY: &'static str = "elt.x";

    fn key(&self) -> u32 {
        self[0]
    }
}

/// A key (`x`) with three payload words.
impl GpuElement for [u32; 4] {
    const WGSL_TYPE: &'static str = "vec4<u32>";
    const WGSL_KEY: &'static str = "elt.x";

    fn key(&self) -> u32 {
        self[0]
    }
}

/// Replaces the element placeholders of a kernel source by the WGSL description of `T`.
pub(crate) fn substitute_element<T: GpuElement>(src: &str) -> String {
    src.replace("ELEMENT_DECL", T::WGSL_DECL)
        .replace("ELEMENT_KEY", T::WGSL_KEY)
        .replace("ELEMENT_TYPE", T::WGSL_TYPE)
}

#[cfg(test)]
mod test {
    use super::{substitute_element, GpuElement};

    #[test]
    fn substitute_pair_element() {
        let src = "ELEMENT_DECL\nfn key(elt: ELEMENT_TYPE) -> u32 { return ELEMENT_KEY; }";
        assert_eq!(
            substitute_element::<[u32; 2]>(src),
            "\nfn key(elt: vec2<u32>) -> u32 { return elt.x; }"
        );
        assert_eq!([7u32, 3].key(), 7);
    }
}
