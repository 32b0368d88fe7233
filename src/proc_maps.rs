//! `/proc/<pid>/maps` parser: takes the initial snapshot of a target's
//! already-existing mappings at attach time.
//!
//! A hand-rolled line parser rather than a regex, since the format's fields
//! are fixed-width-ish but regex would pull in a crate for something this
//! mechanical.

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub is_read: bool,
    pub is_write: bool,
    pub is_executable: bool,
    pub file_offset: u64,
    pub name: String,
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    match p.find(delimiter) {
        Some(index) => {
            let (before, after) = p.split_at(index);
            *p = &after[delimiter.len_utf8()..];
            before
        }
        None => {
            let before = *p;
            *p = "";
            before
        }
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn skip_whitespace(p: &mut &str) {
    while let Some(' ') = p.chars().next() {
        *p = &p[1..];
    }
}

/// Parses the contents of `/proc/<pid>/maps`. Malformed lines (there
/// shouldn't be any, this file is kernel-generated) are skipped rather than
/// aborting the whole snapshot.
pub fn parse(maps: &str) -> Vec<Region> {
    let mut output = Vec::new();
    for mut line in maps.trim().lines() {
        if let Some(region) = parse_line(&mut line) {
            output.push(region);
        }
    }
    output
}

fn parse_line(line: &mut &str) -> Option<Region> {
    let start = u64::from_str_radix(get_until(line, '-'), 16).ok()?;
    let end = u64::from_str_radix(get_until(line, ' '), 16).ok()?;
    let is_read = get_char(line)? == 'r';
    let is_write = get_char(line)? == 'w';
    let is_executable = get_char(line)? == 'x';
    get_char(line)?; // shared/private bit, unused
    get_char(line)?; // space

    let file_offset = u64::from_str_radix(get_until(line, ' '), 16).ok()?;
    get_until(line, ' '); // dev major:minor
    get_until(line, ' '); // inode
    skip_whitespace(line);
    let name = line.to_string();

    Some(Region {
        start,
        end,
        is_read,
        is_write,
        is_executable,
        file_offset,
        name,
    })
}

/// Reads and parses `/proc/<pid>/maps`.
pub fn read(pid: u32) -> std::io::Result<Vec<Region>> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(parse(&contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_maps_file() {
        let maps = "\
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
";
        let regions = parse(maps);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].start, 0x00400000);
        assert_eq!(regions[0].end, 0x0040c000);
        assert!(regions[0].is_read && !regions[0].is_write && regions[0].is_executable);
        assert_eq!(regions[0].name, "/usr/bin/cat");

        assert_eq!(regions[1].name, "[heap]");
        assert!(regions[1].is_write && !regions[1].is_executable);

        assert_eq!(regions[2].name, "");
    }

    #[test]
    fn empty_input_yields_no_regions() {
        assert!(parse("").is_empty());
    }
}
