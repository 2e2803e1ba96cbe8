//! Path syntax: `/`-separated, at most MAXPATH bytes, components at most
//! DIRSIZ. Lookup is by canonical absolute path; `./` and `.` prefixes and
//! components are stripped before lookup.

use arrayvec::ArrayVec;

use crate::param::{DIRSIZ, MAXPATH};

/// A canonical absolute path: starts with `/`, no repeated or trailing
/// slashes (except the root itself), no `.` components.
pub struct PathBuf {
    buf: ArrayVec<u8, MAXPATH>,
}

/// Remove `./` and `.` from the beginning of a path.
pub fn strip_dots(mut path: &[u8]) -> &[u8] {
    loop {
        if path.starts_with(b"./") {
            path = &path[2..];
        } else if path.starts_with(b".") {
            path = &path[1..];
        } else {
            return path;
        }
    }
}

impl PathBuf {
    pub fn root() -> Self {
        let mut buf = ArrayVec::new();
        buf.push(b'/');
        Self { buf }
    }

    /// Canonicalize an absolute path. Repeated slashes collapse, `.`
    /// components disappear, a trailing slash is dropped. Errors on empty
    /// input, relative input, overlong components, or overflow.
    pub fn from_absolute(path: &[u8]) -> Result<Self, ()> {
        if path.first() != Some(&b'/') {
            return Err(());
        }
        let mut out = Self::root();
        for component in path.split(|&c| c == b'/') {
            if component.is_empty() || component == b"." {
                continue;
            }
            out.push_component(component)?;
        }
        Ok(out)
    }

    /// `base` joined with relative `rel` (also canonicalizing `rel`).
    pub fn join(base: &Self, rel: &[u8]) -> Result<Self, ()> {
        let mut out = Self {
            buf: base.buf.clone(),
        };
        for component in rel.split(|&c| c == b'/') {
            if component.is_empty() || component == b"." {
                continue;
            }
            out.push_component(component)?;
        }
        Ok(out)
    }

    fn push_component(&mut self, component: &[u8]) -> Result<(), ()> {
        if component.len() > DIRSIZ {
            return Err(());
        }
        let sep = if self.is_root() { 0 } else { 1 };
        if self.buf.len() + sep + component.len() > MAXPATH {
            return Err(());
        }
        if sep == 1 {
            self.buf.push(b'/');
        }
        self.buf.try_extend_from_slice(component).map_err(|_| ())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_root(&self) -> bool {
        self.buf.len() == 1
    }

    /// Split into the parent directory path and the final component.
    /// The root has no parent.
    pub fn parent_and_name(&self) -> Option<(&[u8], &[u8])> {
        if self.is_root() {
            return None;
        }
        let cut = self.buf.iter().rposition(|&c| c == b'/').unwrap();
        let parent = if cut == 0 { &self.buf[..1] } else { &self.buf[..cut] };
        Some((parent, &self.buf[cut + 1..]))
    }
}

/// The parent directory of a canonical path slice, as a slice of it.
pub fn parent_of(path: &[u8]) -> Option<&[u8]> {
    if path == b"/" {
        return None;
    }
    let cut = path.iter().rposition(|&c| c == b'/')?;
    Some(if cut == 0 { &path[..1] } else { &path[..cut] })
}

/// The final component of a canonical path slice.
pub fn name_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&c| c == b'/') {
        Some(cut) => &path[cut + 1..],
        None => path,
    }
}

/// Resolve a user-supplied path against a base directory (the cwd or a
/// dirfd's directory): strip `./`/`.` prefixes, then either take it as
/// absolute or join it to `base`.
pub fn resolve(base: Option<&PathBuf>, path: &[u8]) -> Result<PathBuf, ()> {
    let path = strip_dots(path);
    if path.first() == Some(&b'/') {
        PathBuf::from_absolute(path)
    } else {
        match base {
            Some(dir) => PathBuf::join(dir, path),
            None => {
                let root = PathBuf::root();
                PathBuf::join(&root, path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_dot_slash() {
        assert_eq!(strip_dots(b"./a/b"), b"a/b");
        assert_eq!(strip_dots(b"././a"), b"a");
        assert_eq!(strip_dots(b"."), b"");
        assert_eq!(strip_dots(b"a/./b"), b"a/./b");
        // A leading ".." decays dot by dot: "../x" -> "./x" -> "x", as in
        // the classic helper.
        assert_eq!(strip_dots(b"../x"), b"x");
    }

    #[test]
    fn canonicalizes_absolute_paths() {
        let p = PathBuf::from_absolute(b"//a///b/./c/").unwrap();
        assert_eq!(p.as_bytes(), b"/a/b/c");
        assert_eq!(PathBuf::from_absolute(b"/").unwrap().as_bytes(), b"/");
        assert!(PathBuf::from_absolute(b"relative").is_err());
    }

    #[test]
    fn join_appends_with_separator() {
        let base = PathBuf::from_absolute(b"/usr").unwrap();
        let joined = PathBuf::join(&base, b"bin/sh").unwrap();
        assert_eq!(joined.as_bytes(), b"/usr/bin/sh");

        let root = PathBuf::root();
        assert_eq!(PathBuf::join(&root, b"etc").unwrap().as_bytes(), b"/etc");
    }

    #[test]
    fn parent_and_name_split() {
        let p = PathBuf::from_absolute(b"/a/b/c").unwrap();
        assert_eq!(p.parent_and_name().unwrap(), (&b"/a/b"[..], &b"c"[..]));

        let top = PathBuf::from_absolute(b"/a").unwrap();
        assert_eq!(top.parent_and_name().unwrap(), (&b"/"[..], &b"a"[..]));

        assert!(PathBuf::root().parent_and_name().is_none());
        assert_eq!(parent_of(b"/a/b"), Some(&b"/a"[..]));
        assert_eq!(parent_of(b"/a"), Some(&b"/"[..]));
        assert_eq!(parent_of(b"/"), None);
        assert_eq!(name_of(b"/a/b"), b"b");
    }

    #[test]
    fn resolve_relative_against_base() {
        let cwd = PathBuf::from_absolute(b"/home").unwrap();
        assert_eq!(
            resolve(Some(&cwd), b"./notes.txt").unwrap().as_bytes(),
            b"/home/notes.txt"
        );
        assert_eq!(resolve(Some(&cwd), b"/abs").unwrap().as_bytes(), b"/abs");
        assert_eq!(resolve(None, b"x").unwrap().as_bytes(), b"/x");
    }

    #[test]
    fn length_limits_are_enforced() {
        let long = [b'a'; MAXPATH + 1];
        let mut with_slash = std::vec::Vec::new();
        with_slash.push(b'/');
        with_slash.extend_from_slice(&long);
        assert!(PathBuf::from_absolute(&with_slash).is_err());
    }
}
