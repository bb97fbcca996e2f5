//! Paths and path elements.
//!
//! A path is walked one slash-separated element at a time. Runs of slashes
//! separate elements like a single slash would, trailing slashes are
//! consumed with the element before them, and an element longer than
//! `DIRSIZ` is silently capped at `DIRSIZ` bytes.

use super::DIRSIZ;

/// One path element: a directory-entry name of at most `DIRSIZ` bytes,
/// free of NUL characters.
#[derive(PartialEq)]
#[repr(transparent)]
pub struct FileName {
    inner: [u8],
}

impl FileName {
    /// Wraps a name, capping it at `DIRSIZ` bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        let capped = if bytes.len() > DIRSIZ {
            &bytes[..DIRSIZ]
        } else {
            bytes
        };
        debug_assert!(capped.iter().all(|b| *b != 0));
        // SAFETY: `FileName` is a `repr(transparent)` wrapper around `[u8]`,
        // the slice was just capped at DIRSIZ bytes, and the caller promises
        // it holds no NUL.
        unsafe { &*(capped as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

/// A slash-separated path, free of NUL characters.
#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    /// Wraps a path string. The argument-marshalling layer guarantees the
    /// absence of embedded NULs; this constructor re-checks it.
    pub fn new(path: &str) -> &Self {
        assert!(!path.as_bytes().contains(&0), "path: embedded NUL");
        // SAFETY: just checked.
        unsafe { Self::from_bytes(path.as_bytes()) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `Path` is a `repr(transparent)` wrapper around `[u8]`, and
        // the caller promises the slice holds no NUL.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Splits off the leading path element: returns the remaining path and
    /// the element, or `None` when nothing but slashes is left.
    ///
    /// The remainder carries no leading slashes, so a caller can test
    /// `is_empty()` on it to recognize the final element.
    ///
    /// ```text
    /// skipelem("a/bb/c") = Some(("bb/c", "a"))
    /// skipelem("///a//bb") = Some(("bb", "a"))
    /// skipelem("a") = Some(("", "a"))
    /// skipelem("") = skipelem("////") = None
    /// ```
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let slashes = |b: &&u8| **b == b'/';

        // Element starts past the leading slash run and stops at the next
        // slash (or the end); the remainder starts past the slash run that
        // follows the element.
        let lead = self.inner.iter().take_while(slashes).count();
        let after_lead = &self.inner[lead..];
        if after_lead.is_empty() {
            return None;
        }

        let elem_len = after_lead.iter().take_while(|b| **b != b'/').count();
        let (elem, tail) = after_lead.split_at(elem_len);
        let sep = tail.iter().take_while(slashes).count();

        // SAFETY: both slices come out of `self.inner`, which holds no NUL.
        let name = unsafe { FileName::from_bytes(elem) };
        let rest = unsafe { Self::from_bytes(&tail[sep..]) };
        Some((rest, name))
    }

    /// Whether the path starts at the root directory.
    pub fn is_absolute(&self) -> bool {
        self.inner.first() == Some(&b'/')
    }

    /// Whether no elements (not even slashes) remain.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
