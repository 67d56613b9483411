/// Line sources for log files.
///
/// A log file is read either forward (oldest line first) or backward (newest line first).  Reading
/// backward is what makes it cheap to look at the last few minutes of a large log: the caller can
/// stop as soon as it is clearly outside the time window.  Compressed files can't be read backward,
/// so they are decompressed as a stream and read forward to the end.
///
/// Both readers are lazy, finite, and can't be restarted.  Lines are yielded without their
/// terminating newline.  Bytes that are not UTF-8 are replaced, since log lines frequently contain
/// request data we don't control, and one bad byte should not cost us the line.
///
/// The files are usually being appended to while we read them.  The backward reader looks at the
/// size once, when the file is opened, and ignores anything appended later.  If the file shrinks
/// under us (log rotation with truncation) the backward reader ends the stream quietly at that
/// point instead of failing.
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// The order in which a source yields lines.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Forward,
    Backward,
}

/// A stream of lines from one log file.

pub struct LineSource {
    order: ScanOrder,
    lines: Lines,
}

enum Lines {
    Forward(ForwardLines),
    Backward(BackwardLines),
}

impl LineSource {
    pub fn order(&self) -> ScanOrder {
        self.order
    }
}

impl Iterator for LineSource {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines {
            Lines::Forward(ref mut l) => l.next(),
            Lines::Backward(ref mut l) => l.next(),
        }
    }
}

/// True if the file name says the contents are gzip-compressed.

pub fn is_compressed(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

/// Open a log file with the best strategy for it: compressed files forward through a decompressor,
/// everything else backward.

pub fn open_logfile(path: &Path) -> Result<LineSource> {
    if is_compressed(path) {
        let file = File::open(path).with_context(|| format!("Can't open {}", path.display()))?;
        Ok(LineSource {
            order: ScanOrder::Forward,
            lines: Lines::Forward(ForwardLines::new(Box::new(MultiGzDecoder::new(file)))),
        })
    } else {
        open_backward(path)
    }
}

/// Open a plain log file for reading oldest line first.

pub fn open_forward(path: &Path) -> Result<LineSource> {
    let file = File::open(path).with_context(|| format!("Can't open {}", path.display()))?;
    Ok(LineSource {
        order: ScanOrder::Forward,
        lines: Lines::Forward(ForwardLines::new(Box::new(file))),
    })
}

/// Open a plain log file for reading newest line first.

pub fn open_backward(path: &Path) -> Result<LineSource> {
    let file = File::open(path).with_context(|| format!("Can't open {}", path.display()))?;
    Ok(LineSource {
        order: ScanOrder::Backward,
        lines: Lines::Backward(BackwardLines::new(file)?),
    })
}

struct ForwardLines {
    reader: BufReader<Box<dyn Read>>,
    buf: Vec<u8>,
}

impl ForwardLines {
    fn new(reader: Box<dyn Read>) -> ForwardLines {
        ForwardLines {
            reader: BufReader::new(reader),
            buf: vec![],
        }
    }
}

impl Iterator for ForwardLines {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                }
                Some(Ok(String::from_utf8_lossy(&self.buf).into_owned()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

const CHUNKSIZ: usize = 65536;

// The reader keeps `pending`, the bytes in [pos, pos+pending.len()) that have been read but not
// yet returned as lines.  Lines are peeled off the end of `pending`; when it holds no newline
// another chunk is read from before `pos` and prepended.

struct BackwardLines {
    file: File,
    pos: u64,
    pending: Vec<u8>,
    started: bool,
    done: bool,
    chunksiz: usize,
}

impl BackwardLines {
    fn new(file: File) -> io::Result<BackwardLines> {
        let size = file.metadata()?.len();
        Ok(BackwardLines {
            file,
            pos: size,
            pending: vec![],
            started: false,
            done: false,
            chunksiz: CHUNKSIZ,
        })
    }

    // Read the chunk before `pos`.  Returns false if nothing could be read, either because we're at
    // the start of the file or because the file was truncated under us.
    fn refill(&mut self) -> io::Result<bool> {
        if self.pos == 0 {
            return Ok(false);
        }
        let n = usize::min(self.chunksiz, self.pos as usize);
        let start = self.pos - n as u64;
        let mut chunk = vec![0u8; n];
        self.file.seek(SeekFrom::Start(start))?;
        match self.file.read_exact(&mut chunk) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("log file shrank while reading backward, stopping");
                self.pos = 0;
                self.pending.clear();
                self.done = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.pos = start;
        chunk.extend_from_slice(&self.pending);
        self.pending = chunk;
        if !self.started {
            // The newline ending the last line does not start an empty line after it.
            self.started = true;
            if self.pending.last() == Some(&b'\n') {
                self.pending.pop();
            }
        }
        Ok(true)
    }
}

impl Iterator for BackwardLines {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(nl) = self.pending.iter().rposition(|c| *c == b'\n') {
                let line = self.pending.split_off(nl + 1);
                self.pending.truncate(nl);
                return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
            }
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    if self.done || !self.started {
                        // Truncated, or empty to begin with
                        self.done = true;
                        return None;
                    }
                    self.done = true;
                    let line = std::mem::take(&mut self.pending);
                    return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents).unwrap();
    f.flush().unwrap();
    f
}

#[cfg(test)]
fn collect(source: LineSource) -> Vec<String> {
    source.map(|l| l.unwrap()).collect::<Vec<String>>()
}

#[test]
fn test_backward_lines() {
    let f = write_temp(b"one\ntwo\n\nthree\n");
    let lines = collect(open_backward(f.path()).unwrap());
    assert_eq!(lines, vec!["three", "", "two", "one"]);

    // No newline at the end
    let f = write_temp(b"one\ntwo");
    let lines = collect(open_backward(f.path()).unwrap());
    assert_eq!(lines, vec!["two", "one"]);

    // Empty file, and a file with only a newline
    let f = write_temp(b"");
    assert!(collect(open_backward(f.path()).unwrap()).is_empty());
    let f = write_temp(b"\n");
    assert_eq!(collect(open_backward(f.path()).unwrap()), vec![""]);
}

#[test]
fn test_backward_lines_across_chunks() {
    // Lines straddle chunk boundaries when the chunk is tiny.
    let mut text = String::new();
    for i in 0..100 {
        text += &format!("line number {i}\n");
    }
    let f = write_temp(text.as_bytes());
    let file = File::open(f.path()).unwrap();
    let mut lines = BackwardLines::new(file).unwrap();
    lines.chunksiz = 7;
    let got = lines.map(|l| l.unwrap()).collect::<Vec<String>>();
    assert_eq!(got.len(), 100);
    assert_eq!(got[0], "line number 99");
    assert_eq!(got[99], "line number 0");
}

#[test]
fn test_backward_ignores_appended_data() {
    use std::io::Write;
    let mut f = write_temp(b"a\nb\n");
    let mut source = open_backward(f.path()).unwrap();
    f.write_all(b"c\n").unwrap();
    f.flush().unwrap();
    assert_eq!(source.next().unwrap().unwrap(), "b");
    assert_eq!(source.next().unwrap().unwrap(), "a");
    assert!(source.next().is_none());
}

#[test]
fn test_backward_survives_truncation() {
    let mut text = String::new();
    for i in 0..20 {
        text += &format!("line {i}\n");
    }
    let f = write_temp(text.as_bytes());
    let file = File::open(f.path()).unwrap();
    let mut lines = BackwardLines::new(file).unwrap();
    lines.chunksiz = 16;
    assert_eq!(lines.next().unwrap().unwrap(), "line 19");
    f.as_file().set_len(10).unwrap();
    // Whatever comes out, the stream ends without an error.
    for l in lines {
        assert!(l.is_ok());
    }
}

#[test]
fn test_forward_lines() {
    let f = write_temp(b"one\ntwo\n\nthree");
    let source = open_forward(f.path()).unwrap();
    assert_eq!(source.order(), ScanOrder::Forward);
    assert_eq!(collect(source), vec!["one", "two", "", "three"]);
}

#[test]
fn test_gzip_lines() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("error.log.1.gz");
    let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    enc.write_all(b"first\nsecond\n").unwrap();
    enc.finish().unwrap();

    assert!(is_compressed(&path));
    let source = open_logfile(&path).unwrap();
    assert_eq!(source.order(), ScanOrder::Forward);
    assert_eq!(collect(source), vec!["first", "second"]);
}

#[test]
fn test_plain_files_read_backward() {
    let f = write_temp(b"x\ny\n");
    let source = open_logfile(f.path()).unwrap();
    assert_eq!(source.order(), ScanOrder::Backward);
    assert_eq!(collect(source), vec!["y", "x"]);
}

#[test]
fn test_missing_file() {
    assert!(open_logfile(Path::new("/nonexistent/phptop/error.log")).is_err());
    assert!(open_logfile(Path::new("/nonexistent/phptop/error.log.gz")).is_err());
}
