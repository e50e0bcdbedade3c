/// Creation-time options for a [`crate::Vm`].
///
/// ```rust
/// use arenavm::{VmArg, VmParams};
///
/// assert!(!VmParams::default().top_down);
/// assert!(VmParams::new().top_down(true).top_down);
/// assert!(VmParams::from_args(&[VmArg::TopDown(true)]).top_down);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmParams {
    /// Ask the OS to place the reservation at the high end of the address
    /// space instead of the low end. Only a hint, and only Windows honours
    /// it: `mmap` has no portable way to express this.
    pub top_down: bool,
}

/// Keyword arguments understood by [`VmParams::from_args`]. Arenas usually
/// receive a list of these along with their own creation arguments and
/// forward it untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VmArg {
    TopDown(bool),
}

impl VmParams {
    /// Same as [`VmParams::default`], usable in const context.
    pub const fn new() -> Self {
        Self { top_down: false }
    }

    pub const fn top_down(mut self, top_down: bool) -> Self {
        self.top_down = top_down;
        self
    }

    /// Builds parameters from keyword arguments. Keys that are not present
    /// keep their default value. If a key is given more than once, the
    /// first occurrence wins.
    pub fn from_args<'a>(args: impl IntoIterator<Item = &'a VmArg>) -> Self {
        let mut params = Self::new();
        let mut top_down = None;

        for arg in args {
            match *arg {
                VmArg::TopDown(value) => {
                    top_down.get_or_insert(value);
                }
            }
        }

        if let Some(value) = top_down {
            params.top_down = value;
        }

        params
    }
}
