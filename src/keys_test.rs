use crate::keys::*;

fn k(s: &str) -> MusicalKey {
    s.parse().unwrap()
}

#[test]
fn test_parse_key() {
    assert_eq!(k("A minor"), MusicalKey::new(PitchClass::A, Mode::Minor));
    assert_eq!(k("Am"), MusicalKey::new(PitchClass::A, Mode::Minor));
    assert_eq!(k("c"), MusicalKey::new(PitchClass::C, Mode::Major));
    assert_eq!(k("F#m"), MusicalKey::new(PitchClass::FSharp, Mode::Minor));
    assert_eq!(k("f♯ min"), MusicalKey::new(PitchClass::FSharp, Mode::Minor));
    assert_eq!(k(" Ebmaj "), MusicalKey::new(PitchClass::DSharp, Mode::Major));
    assert_eq!(k("Gb minor"), k("F# minor"));
    assert_eq!(k("Cb"), MusicalKey::new(PitchClass::B, Mode::Major));
    assert!("H minor".parse::<MusicalKey>().is_err());
    assert!("".parse::<MusicalKey>().is_err());
}

#[test]
fn test_key_display() {
    assert_eq!(k("Bbm").to_string(), "A# minor");
    assert_eq!(k("G").to_string(), "G major");
    assert_eq!(serde_json::to_string(&k("F#m")).unwrap(), "\"F# minor\"");
    assert_eq!(serde_json::from_str::<MusicalKey>("\"Db\"").unwrap(), k("C#"));
}

#[test]
fn test_distance() {
    assert_eq!(k("C").distance(&k("C")), 0);
    assert_eq!(k("C").distance(&k("G")), 1);
    // The shorter way around the circle.
    assert_eq!(k("C").distance(&k("F")), 1);
    assert_eq!(k("C").distance(&k("F#")), 6);
    assert_eq!(k("Am").distance(&k("Dm")), 1);
    // Changing scale costs three steps.
    assert_eq!(k("A").distance(&k("Am")), 3);
    assert_eq!(k("C").distance(&k("Am")), 6);
    assert_eq!(k("Em").distance(&k("G")), k("G").distance(&k("Em")));
}

#[test]
fn test_is_compatible_with() {
    assert!(k("Am").is_compatible_with(&k("Em"), 1));
    assert!(!k("Am").is_compatible_with(&k("Bm"), 1));
    assert!(k("Am").is_compatible_with(&k("A"), 3));
}

#[test]
fn test_compatible_keys() {
    assert_eq!(compatible_keys(&k("C"), 0), vec![k("C")]);
    assert_eq!(compatible_keys(&k("C"), 1), vec![k("C"), k("G"), k("F")]);
    assert_eq!(
        compatible_keys(&k("Am"), 3),
        vec![k("Cm"), k("Gm"), k("Dm"), k("A"), k("Am"), k("Em"), k("Bm"), k("F#m")]
    );
    assert_eq!(compatible_keys(&k("Am"), 9).len(), 24);
}

#[test]
fn test_circle_positions() {
    for (i, pc) in ALL_PITCH_CLASSES.iter().enumerate() {
        assert_eq!(pc.circle_position() as usize, i);
    }
}
