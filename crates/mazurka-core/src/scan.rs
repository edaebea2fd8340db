//! Request-completeness scanner.
//!
//! Walks the read buffer one byte at a time from `checked_idx`, deciding
//! whether a full request has arrived.  A first line with only two words
//! terminated by a bare newline is an HTTP/0.9 request; after three words we
//! keep scanning until a blank line in any of the end-of-line forms the wild
//! still produces (LF LF, CR CR, CRLF CRLF, CRLF CR, CR LF LF).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    FirstWord,
    FirstWs,
    SecondWord,
    SecondWs,
    ThirdWord,
    ThirdWs,
    Line,
    Lf,
    Cr,
    CrLf,
    CrLfCr,
    Bogus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A complete request sits in the buffer.
    Complete,
    /// Keep reading.
    NeedMore,
    /// The request line is malformed beyond repair.
    Bad,
}

/// Advance the scanner over `buf[*checked_idx..read_idx]`.  `checked_idx`
/// is left at the first unexamined byte, so the scan resumes where it
/// stopped when more bytes arrive.
pub fn got_request(
    buf: &[u8],
    checked_idx: &mut usize,
    read_idx: usize,
    state: &mut ScanState,
) -> ScanOutcome {
    use ScanState::*;

    while *checked_idx < read_idx {
        let c = buf[*checked_idx];
        *checked_idx += 1;

        match *state {
            FirstWord => match c {
                b' ' | b'\t' => *state = FirstWs,
                b'\n' | b'\r' => {
                    *state = Bogus;
                    return ScanOutcome::Bad;
                }
                _ => {}
            },

            FirstWs => match c {
                b' ' | b'\t' => {}
                b'\n' | b'\r' => {
                    *state = Bogus;
                    return ScanOutcome::Bad;
                }
                _ => *state = SecondWord,
            },

            SecondWord => match c {
                b' ' | b'\t' => *state = SecondWs,
                // Only two words on the line: an HTTP/0.9 request.
                b'\n' | b'\r' => return ScanOutcome::Complete,
                _ => {}
            },

            SecondWs => match c {
                b' ' | b'\t' => {}
                b'\n' | b'\r' => {
                    *state = Bogus;
                    return ScanOutcome::Bad;
                }
                _ => *state = ThirdWord,
            },

            ThirdWord => match c {
                b' ' | b'\t' => *state = ThirdWs,
                b'\n' => *state = Lf,
                b'\r' => *state = Cr,
                _ => {}
            },

            ThirdWs => match c {
                b' ' | b'\t' => {}
                b'\n' => *state = Lf,
                b'\r' => *state = Cr,
                _ => {
                    *state = Bogus;
                    return ScanOutcome::Bad;
                }
            },

            Line => match c {
                b'\n' => *state = Lf,
                b'\r' => *state = Cr,
                _ => {}
            },

            Lf => match c {
                b'\n' => return ScanOutcome::Complete,
                b'\r' => *state = Cr,
                _ => *state = Line,
            },

            Cr => match c {
                b'\n' => *state = CrLf,
                b'\r' => return ScanOutcome::Complete,
                _ => *state = Line,
            },

            CrLf => match c {
                b'\n' => return ScanOutcome::Complete,
                b'\r' => *state = CrLfCr,
                _ => *state = Line,
            },

            CrLfCr => match c {
                b'\n' | b'\r' => return ScanOutcome::Complete,
                _ => *state = Line,
            },

            Bogus => return ScanOutcome::Bad,
        }
    }

    ScanOutcome::NeedMore
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(bytes: &[u8]) -> ScanOutcome {
        let mut idx = 0;
        let mut state = ScanState::default();
        got_request(bytes, &mut idx, bytes.len(), &mut state)
    }

    #[test]
    fn crlf_crlf_terminates() {
        assert_eq!(
            scan_all(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n"),
            ScanOutcome::Complete
        );
    }

    #[test]
    fn lf_lf_terminates() {
        assert_eq!(scan_all(b"GET / HTTP/1.0\nHost: h\n\n"), ScanOutcome::Complete);
    }

    #[test]
    fn cr_cr_terminates() {
        assert_eq!(scan_all(b"GET / HTTP/1.0\r\r"), ScanOutcome::Complete);
    }

    #[test]
    fn crlf_cr_terminates() {
        assert_eq!(scan_all(b"GET / HTTP/1.0\r\n\r"), ScanOutcome::Complete);
    }

    #[test]
    fn two_words_is_http09() {
        assert_eq!(scan_all(b"GET /\n"), ScanOutcome::Complete);
        assert_eq!(scan_all(b"GET /index.html\r"), ScanOutcome::Complete);
    }

    #[test]
    fn bare_newline_first_is_bad() {
        assert_eq!(scan_all(b"\nGET / HTTP/1.0\r\n\r\n"), ScanOutcome::Bad);
        assert_eq!(scan_all(b"GET \n"), ScanOutcome::Bad);
        assert_eq!(scan_all(b"GET / \r"), ScanOutcome::Bad);
    }

    #[test]
    fn partial_request_needs_more() {
        assert_eq!(scan_all(b"GET / HTTP/1.0\r\nHost:"), ScanOutcome::NeedMore);
        assert_eq!(scan_all(b"GE"), ScanOutcome::NeedMore);
    }

    #[test]
    fn resumes_across_reads() {
        let bytes = b"GET / HTTP/1.0\r\n\r\n";
        let mut idx = 0;
        let mut state = ScanState::default();
        assert_eq!(
            got_request(bytes, &mut idx, 10, &mut state),
            ScanOutcome::NeedMore
        );
        assert_eq!(
            got_request(bytes, &mut idx, bytes.len(), &mut state),
            ScanOutcome::Complete
        );
    }

    // Every prefix of any byte string yields exactly one outcome and the
    // scan never revisits a byte.
    #[test]
    fn totality_over_prefixes() {
        let bytes = b"GET /x HTTP/1.1\r\nA: b\r\n\r\nrest";
        for end in 0..=bytes.len() {
            let mut idx = 0;
            let mut state = ScanState::default();
            let out = got_request(bytes, &mut idx, end, &mut state);
            assert!(idx <= end);
            match out {
                ScanOutcome::Complete | ScanOutcome::NeedMore | ScanOutcome::Bad => {}
            }
        }
    }
}
