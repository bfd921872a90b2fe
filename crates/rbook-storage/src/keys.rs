//! Byte layouts for the durable keyspaces.

/// `students` keyspace: `id_utf8` → bincode(StudentRow)
pub fn student_key(id: &str) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// `grades` keyspace: `student_id_utf8 ++ \x00 ++ subject_utf8` → bincode(GradeRow)
///
/// The `\x00` delimiter guarantees that a prefix scan for student "s1" never
/// bleeds into grades of "s10" (UTF-8 strings cannot contain null bytes, so
/// the delimiter is unique).
pub fn grade_key(student_id: &str, subject: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(student_id.len() + 1 + subject.len());
    buf.extend_from_slice(student_id.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(subject.as_bytes());
    buf
}

/// Prefix covering every grade row of one student: `student_id_utf8 ++ \x00`.
pub fn grade_prefix(student_id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(student_id.len() + 1);
    buf.extend_from_slice(student_id.as_bytes());
    buf.push(0x00);
    buf
}

/// `counts` keyspace: `student_id_utf8` → bincode(AccessCount)
pub fn count_key(student_id: &str) -> Vec<u8> {
    student_id.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_prefix_no_bleed() {
        // "s1" prefix must not match grade rows for "s10".
        let s1_prefix = grade_prefix("s1");
        let s10_math = grade_key("s10", "math");
        let s1_math = grade_key("s1", "math");

        assert!(s1_math.starts_with(&s1_prefix));
        assert!(!s10_math.starts_with(&s1_prefix));
    }

    #[test]
    fn grade_key_sorts_by_subject_within_student() {
        let a = grade_key("s1", "art");
        let b = grade_key("s1", "math");
        assert!(a < b);
    }

    #[test]
    fn subject_is_recoverable_from_grade_key() {
        let key = grade_key("s1", "math");
        let null_pos = key.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&key[..null_pos], b"s1");
        assert_eq!(&key[null_pos + 1..], b"math");
    }
}
