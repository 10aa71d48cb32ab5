//! Read NIST-style MSP spectral library files.
mod reader;

pub use reader::{MSPError, MSPReader, MSPReaderType, MSPRecord};

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::Polarity;
    use std::io::Write;

    #[test_log::test]
    fn test_reader() {
        let reader = MSPReader::open_path("./test/data/library.msp").unwrap();
        let records: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 5);

        let caffeine = &records[0];
        assert_eq!(caffeine.name, "Caffeine");
        assert_eq!(caffeine.precursor_mz, Some(195.0877));
        assert_eq!(caffeine.polarity, Polarity::Positive);
        assert_eq!(caffeine.identifier.as_deref(), Some("REF0001"));
        assert_eq!(
            caffeine.inchikey.as_deref(),
            Some("RYYVLZVUVIJVGH-UHFFFAOYSA-N")
        );
        assert_eq!(caffeine.declared_peak_count, Some(4));
        // The zero intensity peak is dropped
        assert_eq!(caffeine.peaks.len(), 3);
        assert_eq!(caffeine.peaks[0].0, 110.0713);

        let adenine = &records[1];
        assert_eq!(adenine.peaks, vec![(92.0243, 30.0), (119.0352, 100.0)]);
        assert_eq!(records[2].polarity, Polarity::Negative);
        assert_eq!(records[3].precursor_type, None);
    }

    #[test_log::test]
    fn test_unterminated_records_and_attributes() {
        let text = "Name: A\nPrecursorMZ: 100.5\nComment: first\n50.0 10\nName: B\nPRECURSORMZ: 200.25\nPrecursor_type: [M-H]-\n60.0 5\n";
        let records: Vec<_> = MSPReaderType::new(text.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attributes.get("Comment").map(|s| s.as_str()), Some("first"));
        assert_eq!(records[1].name, "B");
        assert_eq!(records[1].line, 5);
        assert_eq!(records[1].polarity, Polarity::Unknown);
        assert_eq!(records[1].effective_polarity(), Polarity::Negative);
    }

    #[test_log::test]
    fn test_malformed_peaks() {
        let text = "Name: A\nPrecursorMZ: 100.5\n50.0\n";
        let mut reader = MSPReaderType::new(text.as_bytes());
        assert!(matches!(
            reader.next(),
            Some(Err(MSPError::MalformedPeakLine(3, _)))
        ));
        assert!(reader.next().is_none());
    }

    #[test_log::test]
    fn test_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.msp.gz");
        let text = std::fs::read("./test/data/library.msp").unwrap();
        let mut encoder = flate2::write::GzEncoder::new(
            std::fs::File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(&text).unwrap();
        encoder.finish().unwrap();

        let records: Vec<_> = MSPReader::open_path(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 5);
    }
}
